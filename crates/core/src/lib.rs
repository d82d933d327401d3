#![forbid(unsafe_code)]

pub mod event;
pub mod types;

pub use event::{encode_reference_hash, Event, EventError, EventReference};
pub use types::*;
