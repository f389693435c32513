use thiserror::Error;

use crate::store::StoreError;
use crate::types::BackendId;

/// Errors raised while routing through the ring
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RingError {
    /// The owning backend failed the operation
    #[error("{backend} unavailable: {source}")]
    BackendUnavailable {
        backend: BackendId,
        #[source]
        source: StoreError,
    },

    /// Every backend is down; the ring must be rebuilt
    #[error("no live backends")]
    NoLiveBackends,

    /// A backend descriptor could not be parsed
    #[error(transparent)]
    InvalidDescriptor(StoreError),
}

impl RingError {
    pub(crate) fn unavailable(backend: BackendId, source: StoreError) -> Self {
        Self::BackendUnavailable { backend, source }
    }

    /// Whether the caller should back off and rebuild its ring
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::NoLiveBackends)
    }
}
