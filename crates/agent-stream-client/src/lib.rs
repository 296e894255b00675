//! Client for execution-event streams.
//!
//! [`StreamClient`] starts runs on a stream server, decodes the SSE body into
//! typed [`Event`](agent_stream_core::Event)s and rebuilds the execution tree.

pub mod client;
pub mod config;
pub mod errors;
pub mod stream;

pub use client::{RunEvents, StreamClient};
pub use config::{DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT, StreamClientConfig};
pub use errors::ClientError;
pub use stream::{EventStream, event_stream, reconstruct};
