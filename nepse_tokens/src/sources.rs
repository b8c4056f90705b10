//! Token bundle sources

use crate::{RefreshTokenRef, TokenBundle};
use async_trait::async_trait;
use std::error;

#[cfg(feature = "http")]
pub mod http;
pub mod in_memory;

#[cfg(feature = "http")]
pub use http::HttpBundleSource;
pub use in_memory::StaticBundleSource;

/// An asynchronous source of token bundles
///
/// Implementations perform the network exchange with the service. Errors are
/// passed through to callers of the credential manager without
/// interpretation, and the manager never retries them.
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// The error type returned in the event that retrieving a bundle fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a bundle without any prior credentials
    async fn fetch_initial_bundle(&self) -> Result<TokenBundle, Self::Error>;

    /// Requests a bundle using the current usable refresh token
    async fn fetch_refreshed_bundle(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<TokenBundle, Self::Error>;
}
