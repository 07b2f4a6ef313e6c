//! Hookline Shared Library
//!
//! Wire protocol, body conversions, and error types shared by the tunnel client.

pub mod error;
pub mod payload;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{
    BodyEncoding, DecodeError, Headers, Query, RequestMessage, ResponseMessage, WireMessage,
};
