//! Core deerstream library (frame parsing, transports, merge reducer, conversation store).

pub mod config;
pub mod events;
pub mod frame;
pub mod merge;
pub mod message;
pub mod research;
pub mod store;
pub mod transport;
