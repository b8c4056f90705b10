use std::{error, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    derive::{DerivationError, TokenKind},
    module::ModuleError,
};

/// A shareable collaborator error
pub type SourceError = Arc<dyn error::Error + Send + Sync + 'static>;

/// An error obtaining usable credentials
///
/// Every caller waiting on the same update receives a clone of the same
/// error, so collaborator errors are held behind an [`Arc`].
#[derive(Clone, Debug, Error)]
pub enum CredentialError {
    /// The bundle source failed
    #[error("error fetching token bundle")]
    Fetch(#[source] SourceError),
    /// The bundle source did not answer within the configured timeout
    #[error("token bundle fetch timed out after {0:?}")]
    FetchTimedOut(Duration),
    /// Computing the positions to strip failed
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    /// Stripping the derived positions left nothing behind
    #[error("reconstructed {0} token is empty")]
    EmptyToken(TokenKind),
    /// The caller stopped waiting before the update finished
    #[error("cancelled while waiting for credential update")]
    Cancelled,
    /// The manager has been closed
    #[error("credential manager is closed")]
    Closed,
    /// The update task ended without reporting a result
    #[error("credential update task aborted")]
    UpdateAborted,
    /// Releasing the derivation module failed
    #[error("error releasing derivation module")]
    Release(#[source] ModuleError),
}

impl CredentialError {
    pub(crate) fn fetch<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Fetch(Arc::new(error))
    }
}
