//! Credential management for the NEPSE market data service
//!
//! The service does not hand out usable tokens directly. Its authentication
//! endpoint returns a _bundle_: five integer salts alongside an access token
//! and a refresh token, each padded with five junk characters at positions
//! that must be computed by calling functions exported from a WebAssembly
//! module the service publishes. Only once those positions are stripped are
//! the tokens accepted by the rest of the API.
//!
//! This library takes care of that whole dance. A [`CredentialManager`] holds
//! the loaded [module][module::DerivationModule], asks a
//! [`BundleSource`][sources::BundleSource] for bundles, derives the positions
//! with [`derive_indices()`][derive::derive_indices()], strips them with
//! [`reconstruct()`], and caches the result for a short validity window.
//!
//! Callers share a single cache. Reading fresh credentials never blocks, and
//! when the cache goes stale only one update is performed no matter how many
//! callers ask for a token at the same time.
//!
//! ```
//! use nepse_clock::DurationSecs;
//! use nepse_tokens::{module::DerivationModule, sources, CredentialManager, ManagerConfig};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let module_bytes = r#"(module
//! #   (func (export "cdx") (param i32 i32 i32 i32 i32) (result i32) local.get 0)
//! #   (func (export "rdx") (param i32 i32 i32 i32 i32) (result i32) local.get 1)
//! #   (func (export "bdx") (param i32 i32 i32 i32 i32) (result i32) local.get 2)
//! #   (func (export "ndx") (param i32 i32 i32 i32 i32) (result i32) local.get 3)
//! #   (func (export "mdx") (param i32 i32 i32 i32 i32) (result i32) local.get 4))"#;
//! let module = DerivationModule::from_bytes(module_bytes)?;
//!
//! let source = sources::HttpBundleSource::with_default_base_url(reqwest::Client::new())?;
//!
//! let manager = CredentialManager::with_config(
//!     source,
//!     module,
//!     ManagerConfig::new(DurationSecs(45)),
//! );
//!
//! # /* Commented out due to this trying to interact with the world.
//! let token = manager.access_token().await?;
//! tracing::info!(%token, "obtained access token");
//! # */
//!
//! manager.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `http` (default): Provides [`HttpBundleSource`][sources::HttpBundleSource],
//!   which talks to the service's authentication endpoints using [reqwest].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
mod bundle;
mod credentials;
pub mod derive;
mod error;
mod manager;
pub mod module;
mod reconstruct;
pub mod sources;

pub use braids::*;
pub use bundle::{Salts, TokenBundle};
pub use credentials::{CredentialStatus, Credentials};
pub use error::{CredentialError, SourceError};
pub use manager::{CredentialManager, ManagerConfig, RefreshStrategy};
pub use reconstruct::reconstruct;
