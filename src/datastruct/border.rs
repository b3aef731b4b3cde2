//! Range endpoints for sorted-set queries.
//!
//! A border is one endpoint of an ordered interval: negative infinity, a
//! finite value or positive infinity, plus an exclusivity flag for open
//! bounds. Score borders order by score, lex borders by member, using the
//! `-`/`+` sentinels of the ZRANGEBYLEX syntax. The skip list range queries
//! are generic over the trait so both kinds share one traversal.

use thiserror::Error;

use crate::datastruct::skiplist::Element;

#[derive(Error, Debug, PartialEq)]
pub enum BorderError {
    #[error("ERR min or max is not a float")]
    NotAFloat,
    #[error("ERR min or max not valid string range item")]
    NotAValidStringRange,
}

pub trait RangeBorder {
    /// Upper-bound check: true when `element` lies at or below this border.
    fn greater(&self, element: &Element) -> bool;
    /// Lower-bound check: true when `element` lies at or above this border.
    fn less(&self, element: &Element) -> bool;
    /// True when `[self, max]` encloses no values at all.
    fn is_intersected(&self, max: &Self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    Finite(f64),
    PosInf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBorder {
    pub bound: ScoreBound,
    pub exclude: bool,
}

impl ScoreBorder {
    pub const NEG_INF: ScoreBorder = ScoreBorder {
        bound: ScoreBound::NegInf,
        exclude: false,
    };
    pub const POS_INF: ScoreBorder = ScoreBorder {
        bound: ScoreBound::PosInf,
        exclude: false,
    };

    pub fn inclusive(value: f64) -> Self {
        ScoreBorder {
            bound: ScoreBound::Finite(value),
            exclude: false,
        }
    }

    fn as_f64(&self) -> f64 {
        match self.bound {
            ScoreBound::NegInf => f64::NEG_INFINITY,
            ScoreBound::Finite(value) => value,
            ScoreBound::PosInf => f64::INFINITY,
        }
    }

    /// Renders back to the command-argument syntax accepted by
    /// [`parse_score_border`].
    pub fn to_arg(&self) -> String {
        match (self.bound, self.exclude) {
            (ScoreBound::NegInf, _) => "-inf".to_string(),
            (ScoreBound::PosInf, _) => "+inf".to_string(),
            (ScoreBound::Finite(value), true) => format!("({}", value),
            (ScoreBound::Finite(value), false) => value.to_string(),
        }
    }
}

impl RangeBorder for ScoreBorder {
    fn greater(&self, element: &Element) -> bool {
        match self.bound {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Finite(value) => {
                if self.exclude {
                    value > element.score
                } else {
                    value >= element.score
                }
            }
        }
    }

    fn less(&self, element: &Element) -> bool {
        match self.bound {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Finite(value) => {
                if self.exclude {
                    value < element.score
                } else {
                    value <= element.score
                }
            }
        }
    }

    fn is_intersected(&self, max: &Self) -> bool {
        let min_value = self.as_f64();
        let max_value = max.as_f64();
        min_value > max_value || (min_value == max_value && (self.exclude || max.exclude))
    }
}

/// Parses a score border from ZRANGEBYSCORE-style syntax: `-inf`, `inf`,
/// `+inf`, a float, or `(` followed by a float for an open bound.
pub fn parse_score_border(s: &str) -> Result<ScoreBorder, BorderError> {
    match s {
        "inf" | "+inf" => return Ok(ScoreBorder::POS_INF),
        "-inf" => return Ok(ScoreBorder::NEG_INF),
        _ => {}
    }
    if let Some(rest) = s.strip_prefix('(') {
        let value: f64 = rest.parse().map_err(|_| BorderError::NotAFloat)?;
        return Ok(ScoreBorder {
            bound: ScoreBound::Finite(value),
            exclude: true,
        });
    }
    let value: f64 = s.parse().map_err(|_| BorderError::NotAFloat)?;
    Ok(ScoreBorder {
        bound: ScoreBound::Finite(value),
        exclude: false,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum LexBound {
    NegInf,
    Finite(String),
    PosInf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexBorder {
    pub bound: LexBound,
    pub exclude: bool,
}

impl RangeBorder for LexBorder {
    fn greater(&self, element: &Element) -> bool {
        match &self.bound {
            LexBound::NegInf => false,
            LexBound::PosInf => true,
            LexBound::Finite(value) => {
                if self.exclude {
                    value.as_str() > element.member.as_str()
                } else {
                    value.as_str() >= element.member.as_str()
                }
            }
        }
    }

    fn less(&self, element: &Element) -> bool {
        match &self.bound {
            LexBound::NegInf => true,
            LexBound::PosInf => false,
            LexBound::Finite(value) => {
                if self.exclude {
                    value.as_str() < element.member.as_str()
                } else {
                    value.as_str() <= element.member.as_str()
                }
            }
        }
    }

    fn is_intersected(&self, max: &Self) -> bool {
        match (&self.bound, &max.bound) {
            (LexBound::PosInf, _) | (_, LexBound::NegInf) => true,
            (LexBound::NegInf, _) | (_, LexBound::PosInf) => false,
            (LexBound::Finite(lo), LexBound::Finite(hi)) => {
                lo > hi || (lo == hi && (self.exclude || max.exclude))
            }
        }
    }
}

/// Parses a lex border from ZRANGEBYLEX-style syntax: `-`, `+`, `[member`
/// for a closed bound or `(member` for an open one.
pub fn parse_lex_border(s: &str) -> Result<LexBorder, BorderError> {
    match s {
        "+" => {
            return Ok(LexBorder {
                bound: LexBound::PosInf,
                exclude: false,
            })
        }
        "-" => {
            return Ok(LexBorder {
                bound: LexBound::NegInf,
                exclude: false,
            })
        }
        _ => {}
    }
    if let Some(rest) = s.strip_prefix('(') {
        return Ok(LexBorder {
            bound: LexBound::Finite(rest.to_string()),
            exclude: true,
        });
    }
    if let Some(rest) = s.strip_prefix('[') {
        return Ok(LexBorder {
            bound: LexBound::Finite(rest.to_string()),
            exclude: false,
        });
    }
    Err(BorderError::NotAValidStringRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(member: &str, score: f64) -> Element {
        Element {
            member: member.to_string(),
            score,
        }
    }

    #[test]
    fn test_parse_score_border() {
        let test_cases = vec![
            ("-inf", Ok(ScoreBorder::NEG_INF)),
            ("inf", Ok(ScoreBorder::POS_INF)),
            ("+inf", Ok(ScoreBorder::POS_INF)),
            ("1.5", Ok(ScoreBorder::inclusive(1.5))),
            (
                "(3",
                Ok(ScoreBorder {
                    bound: ScoreBound::Finite(3.0),
                    exclude: true,
                }),
            ),
            ("abc", Err(BorderError::NotAFloat)),
            ("(abc", Err(BorderError::NotAFloat)),
        ];
        for (input, expected) in test_cases {
            assert_eq!(parse_score_border(input), expected, "parsing {}", input);
        }
    }

    #[test]
    fn test_score_border_round_trip() {
        let borders = vec![
            ScoreBorder::NEG_INF,
            ScoreBorder::POS_INF,
            ScoreBorder::inclusive(0.0),
            ScoreBorder::inclusive(-2.25),
            ScoreBorder {
                bound: ScoreBound::Finite(10.0),
                exclude: true,
            },
        ];
        for border in borders {
            assert_eq!(parse_score_border(&border.to_arg()), Ok(border));
        }
    }

    #[test]
    fn test_score_border_bounds() {
        let open_three = parse_score_border("(3").unwrap();
        assert!(open_three.less(&element("a", 3.5)));
        assert!(!open_three.less(&element("a", 3.0)));
        assert!(open_three.greater(&element("a", 2.0)));
        assert!(!open_three.greater(&element("a", 3.0)));

        assert!(ScoreBorder::NEG_INF.less(&element("a", -1e300)));
        assert!(!ScoreBorder::NEG_INF.greater(&element("a", -1e300)));
        assert!(ScoreBorder::POS_INF.greater(&element("a", 1e300)));
    }

    #[test]
    fn test_score_is_intersected() {
        let one = ScoreBorder::inclusive(1.0);
        let two = ScoreBorder::inclusive(2.0);
        let open_one = ScoreBorder {
            bound: ScoreBound::Finite(1.0),
            exclude: true,
        };
        assert!(!one.is_intersected(&two));
        assert!(two.is_intersected(&one));
        assert!(!one.is_intersected(&one));
        assert!(open_one.is_intersected(&one));
        assert!(!ScoreBorder::NEG_INF.is_intersected(&ScoreBorder::POS_INF));
        assert!(ScoreBorder::POS_INF.is_intersected(&ScoreBorder::NEG_INF));
    }

    #[test]
    fn test_parse_lex_border() {
        assert_eq!(
            parse_lex_border("[abc"),
            Ok(LexBorder {
                bound: LexBound::Finite("abc".to_string()),
                exclude: false,
            })
        );
        assert_eq!(
            parse_lex_border("(abc"),
            Ok(LexBorder {
                bound: LexBound::Finite("abc".to_string()),
                exclude: true,
            })
        );
        assert_eq!(
            parse_lex_border("abc"),
            Err(BorderError::NotAValidStringRange)
        );
    }

    #[test]
    fn test_lex_border_bounds() {
        let min = parse_lex_border("[b").unwrap();
        let max = parse_lex_border("(d").unwrap();
        assert!(min.less(&element("b", 0.0)));
        assert!(!min.less(&element("a", 0.0)));
        assert!(max.greater(&element("c", 0.0)));
        assert!(!max.greater(&element("d", 0.0)));
        assert!(!min.is_intersected(&max));
        assert!(max.is_intersected(&min));
    }
}
