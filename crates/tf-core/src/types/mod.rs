//! Core data types flowing through the pipeline.
//!
//! [`TickerSnapshot`] is the record fetched from a source and stored by the
//! consumer; [`BusMessage`] is its keyed, serialized form on the message bus.

pub mod message;
pub mod symbol;
pub mod ticker;

pub use message::*;
pub use symbol::*;
pub use ticker::*;
