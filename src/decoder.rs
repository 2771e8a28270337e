//! Protocol decoding: raw frames in, typed layer chains out.

pub mod names;
pub mod parser;
pub mod summary;
pub mod types;

pub use parser::{decode, Decoder};
pub use summary::PacketSummary;
pub use types::*;
