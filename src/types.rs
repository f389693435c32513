//! Core domain types shared by every service
//!
//! Identifiers for backends and workers, plus the validated configuration
//! newtypes re-exported from the submodules.

pub mod config;
pub mod validated;

pub use config::{MaxFailures, Port, WorkerCount, duration_serde};
pub use validated::{KeyPrefix, Namespace, ValidationError};

use derive_more::{Display, From};

/// Identifier for a key-value backend tracked by the ring
///
/// Identifiers are assigned in the order backends were configured and stay
/// stable across reconnects, so failure counters survive a backend being
/// dropped from and re-added to the continuum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
#[display("Backend({_0})")]
pub struct BackendId(usize);

impl BackendId {
    /// Create a backend ID from an index
    #[must_use]
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Get the underlying index
    #[must_use]
    #[inline]
    pub const fn as_index(&self) -> usize {
        self.0
    }
}

/// 1-based index of a worker task within one analyzer or vacuum cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct WorkerIndex(usize);

impl WorkerIndex {
    /// Create a worker index, rejecting 0
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        if index == 0 { None } else { Some(Self(index)) }
    }

    #[must_use]
    #[inline]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Iterate `1..=count`
    pub fn range(count: WorkerCount) -> impl Iterator<Item = Self> {
        (1..=count.get()).map(Self)
    }
}
