pub mod bitmap;
pub mod border;
pub mod dict;
pub mod lockmap;
pub mod quicklist;
pub mod set;
pub mod skiplist;
pub mod sortedset;
