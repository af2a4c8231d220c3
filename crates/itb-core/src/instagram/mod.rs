//! Instagram client port and its wire types.

pub mod port;
pub mod types;
