#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
)]

mod connection;
mod flags;
mod frame;
pub mod hpack;
mod stream;
mod stream_coordinator;
mod types;

pub use bytes::Bytes;
pub use connection::Connection;
pub use frame::{Frame, HeaderField, Priority};
pub use types::{
    Error, ErrorType, FrameType, NonZeroStreamId, Result, SettingsParameter, StreamId,
};
