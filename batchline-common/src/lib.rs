//! batchline Common Types
//!
//! Shared types used by both the serving client and the server.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod messages;

pub use codec::{DType, Element, NdArray, Payload, ProtocolTag};
pub use envelope::{Envelope, EnvelopeKind, PROTOCOL_VERSION};
pub use error::{ErrorBody, ErrorKind, ProtocolError};
pub use messages::{
    ClientStatus, Hello, HelloAck, PoolSummary, ServerStatus, WorkerState, WorkerSummary,
};
