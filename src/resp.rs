//! Redis Serialization Protocol values.
//!
//! `RespValue::decode` consumes exactly one complete frame from a `BytesMut`
//! and leaves the buffer untouched when the frame is still partial, so the
//! connection loop can keep reading until a frame completes. Encoding renders
//! the reply forms the command handlers produce: simple strings, errors,
//! integers, bulk strings, arrays and the two null variants.

use bytes::{Buf, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RespError {
    #[error("invalid UTF-8 sequence")]
    InvalidUtf8,
    #[error("unknown RESP type: {0}")]
    UnknownRespType(char),
    #[error("failed to parse integer")]
    FailedToParseInteger,
    #[error("invalid bulk string")]
    InvalidBulkString,
    #[error("invalid array")]
    InvalidArray,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(String),
    Null,
    Array(Vec<RespValue>),
    NullArray,
}

/// One client command as parsed from a RESP array of bulk strings.
pub type CmdLine = Vec<String>;

impl RespValue {
    pub fn ok() -> RespValue {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Encodes the value in wire format.
    pub fn encode(&self) -> String {
        match self {
            RespValue::SimpleString(s) => format!("+{}\r\n", s),
            RespValue::Error(message) => format!("-{}\r\n", message),
            RespValue::Integer(value) => format!(":{}\r\n", value),
            RespValue::BulkString(s) => format!("${}\r\n{}\r\n", s.len(), s),
            RespValue::Null => "$-1\r\n".to_string(),
            RespValue::Array(elements) => {
                let mut out = format!("*{}\r\n", elements.len());
                for element in elements {
                    out.push_str(&element.encode());
                }
                out
            }
            RespValue::NullArray => "*-1\r\n".to_string(),
        }
    }

    /// Decodes one complete frame, consuming it from the buffer. Returns
    /// `Ok(None)` when the buffer does not yet hold a full frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match Self::parse_at(buf, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Finds the `\r\n`-terminated line starting at `pos`; returns the line
    /// without its terminator and the position just past it.
    fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        let rest = &buf[pos..];
        let end = rest.windows(2).position(|window| window == b"\r\n")?;
        Some((&rest[..end], pos + end + 2))
    }

    fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some((line, after_line)) = Self::read_line(buf, pos) else {
            return Ok(None);
        };
        if line.is_empty() {
            return Err(RespError::UnknownRespType('\r'));
        }
        let body = std::str::from_utf8(&line[1..]).map_err(|_| RespError::InvalidUtf8)?;
        match line[0] {
            b'+' => Ok(Some((
                RespValue::SimpleString(body.to_string()),
                after_line,
            ))),
            b'-' => Ok(Some((RespValue::Error(body.to_string()), after_line))),
            b':' => {
                let value: i64 = body.parse().map_err(|_| RespError::FailedToParseInteger)?;
                Ok(Some((RespValue::Integer(value), after_line)))
            }
            b'$' => {
                let length: i64 = body.parse().map_err(|_| RespError::InvalidBulkString)?;
                if length < 0 {
                    return Ok(Some((RespValue::Null, after_line)));
                }
                let length = length as usize;
                if buf.len() < after_line + length + 2 {
                    return Ok(None);
                }
                let content = &buf[after_line..after_line + length];
                if &buf[after_line + length..after_line + length + 2] != b"\r\n" {
                    return Err(RespError::InvalidBulkString);
                }
                let content = std::str::from_utf8(content).map_err(|_| RespError::InvalidUtf8)?;
                Ok(Some((
                    RespValue::BulkString(content.to_string()),
                    after_line + length + 2,
                )))
            }
            b'*' => {
                let length: i64 = body.parse().map_err(|_| RespError::InvalidArray)?;
                if length < 0 {
                    return Ok(Some((RespValue::NullArray, after_line)));
                }
                let mut elements = Vec::with_capacity(length as usize);
                let mut cursor = after_line;
                for _ in 0..length {
                    match Self::parse_at(buf, cursor)? {
                        Some((element, next)) => {
                            elements.push(element);
                            cursor = next;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(elements), cursor)))
            }
            other => Err(RespError::UnknownRespType(other as char)),
        }
    }

    /// Interprets the value as a command line of bulk strings.
    pub fn as_cmd_line(&self) -> Option<CmdLine> {
        let RespValue::Array(elements) = self else {
            return None;
        };
        let mut line = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                RespValue::BulkString(s) => line.push(s.clone()),
                _ => return None,
            }
        }
        if line.is_empty() {
            return None;
        }
        Some(line)
    }

    pub fn from_cmd_line(line: &[String]) -> RespValue {
        RespValue::Array(
            line.iter()
                .map(|arg| RespValue::BulkString(arg.clone()))
                .collect(),
        )
    }
}

/// Builds a command line out of a name and argument slices.
pub fn make_cmd_line(name: &str, args: &[&str]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(name.to_string());
    line.extend(args.iter().map(|arg| arg.to_string()));
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<RespValue> {
        let mut buf = BytesMut::from(input);
        let mut values = Vec::new();
        while let Some(value) = RespValue::decode(&mut buf).unwrap() {
            values.push(value);
        }
        values
    }

    #[test]
    fn test_decode_command_frame() {
        let values = decode_all(b"*3\r\n$5\r\nRPUSH\r\n$4\r\npear\r\n$9\r\nraspberry\r\n");
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].as_cmd_line(),
            Some(vec![
                "RPUSH".to_string(),
                "pear".to_string(),
                "raspberry".to_string()
            ])
        );
    }

    #[test]
    fn test_decode_scalar_frames() {
        let test_cases: Vec<(&[u8], RespValue)> = vec![
            (b"+OK\r\n", RespValue::SimpleString("OK".to_string())),
            (b"-ERR boom\r\n", RespValue::Error("ERR boom".to_string())),
            (b":42\r\n", RespValue::Integer(42)),
            (b"$3\r\nfoo\r\n", RespValue::BulkString("foo".to_string())),
            (b"$-1\r\n", RespValue::Null),
            (b"*-1\r\n", RespValue::NullArray),
            (b"*0\r\n", RespValue::Array(Vec::new())),
        ];
        for (input, expected) in test_cases {
            let values = decode_all(input);
            assert_eq!(values, vec![expected], "decoding {:?}", input);
        }
    }

    #[test]
    fn test_decode_partial_frame_consumes_nothing() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n"[..]);
        let before = buf.len();
        assert_eq!(RespValue::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), before, "partial frame must stay buffered");

        buf.extend_from_slice(b"$5\r\nhello\r\n");
        let value = RespValue::decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            value.as_cmd_line(),
            Some(vec!["PING".to_string(), "hello".to_string()])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_pipelined_frames() {
        let values = decode_all(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut buf = BytesMut::from(&b"!nonsense\r\n"[..]);
        assert_eq!(
            RespValue::decode(&mut buf),
            Err(RespError::UnknownRespType('!'))
        );
    }

    #[test]
    fn test_encode_round_trip() {
        let values = vec![
            RespValue::SimpleString("OK".to_string()),
            RespValue::Error("ERR wrong".to_string()),
            RespValue::Integer(-7),
            RespValue::BulkString("hello world".to_string()),
            RespValue::Null,
            RespValue::NullArray,
            RespValue::Array(vec![
                RespValue::BulkString("a".to_string()),
                RespValue::Integer(1),
            ]),
        ];
        for value in values {
            let mut buf = BytesMut::from(value.encode().as_bytes());
            let decoded = RespValue::decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert!(buf.is_empty());
        }
    }
}
