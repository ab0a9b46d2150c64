//! HTTP collaborators: the remote document store client and the push transport.

pub mod client;
pub mod error;
pub mod push;
pub mod types;

#[cfg(test)]
mod test_support;

pub use client::{RemoteStoreClient, RemoteStoreConfig, DEFAULT_CACHE_TTL_SECS};
pub use error::{RemoteError, Result};
pub use push::{HttpPushTransport, PushConfig};
