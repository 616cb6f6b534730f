//! RSocket over blocking sockets.
//!
//! One connection carries many concurrent request/response, fire-and-forget,
//! request-stream and request-channel interactions, with per-stream flow
//! control, keepalive, and session resumption across dropped transports.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket and TCP byte streams
//! - [`frame`]: Frame model, version 1.0 wire format and length-prefixed framing
//! - [`core`]: The connection engine, client and server

/// Re-export transport types.
pub mod transport {
    pub use rsocket_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rsocket_frame::*;
}

/// Re-export engine types.
pub mod core {
    pub use rsocket_core::*;
}

pub use rsocket_core::{
    Payload, RSocketClient, RSocketError, RSocketServer, RequestHandler, SetupParameters, StreamError, StreamHandle,
};
