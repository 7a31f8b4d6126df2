//! batchline client
//!
//! Submits requests to a batchline server over one WebSocket connection and
//! matches replies back to callers by request id. Several calls may be in
//! flight at once, bounded by `max_concurrency`.
//!
//! ```no_run
//! use batchline_client::{Client, ClientConfig};
//! use serde_json::json;
//!
//! # async fn run() -> batchline_client::Result<()> {
//! let client = Client::connect(ClientConfig::new("ws://localhost:5555/ws").max_concurrency(4)).await?;
//! let result = client.encode(json!(["first item", "second item"])).await?;
//! println!("{:?}", result);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod error;

pub use client::{Client, Fetched, CLIENT_VERSION};
pub use config::ClientConfig;
pub use error::{ClientError, Result};

pub use batchline_common::{NdArray, Payload, ProtocolTag};
