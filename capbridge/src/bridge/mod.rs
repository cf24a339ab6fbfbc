//! Socket bridge between the broker and worker processes.
//!
//! # Architecture
//!
//! - **protocol**: Frame and command types, session/broadcast addressing
//! - **codec**: Delimiter framing codec for AsyncRead/AsyncWrite
//! - **transport**: Loopback listener and port allocation

pub mod codec;
pub mod protocol;
pub mod transport;
