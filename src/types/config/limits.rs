//! Worker-count and failure-threshold configuration types

use std::num::{NonZeroU32, NonZeroUsize};

nonzero_newtype! {
    /// A non-zero number of worker tasks
    ///
    /// Used for the ingestion pool size, the analyzer's configured process
    /// count and the vacuum's process count. A pool of zero workers would
    /// leave the whole metric universe unassigned.
    ///
    /// # Examples
    /// ```
    /// use driftwatch::types::WorkerCount;
    ///
    /// let workers = WorkerCount::new(4).unwrap();
    /// assert_eq!(workers.get(), 4);
    ///
    /// assert!(WorkerCount::new(0).is_none());
    /// ```
    #[doc(alias = "processes")]
    pub struct WorkerCount(NonZeroUsize: usize, serialize as serialize_u64);
}

impl WorkerCount {
    /// Default worker count
    pub const DEFAULT: Self = Self(NonZeroUsize::new(2).unwrap());
}

impl std::str::FromStr for WorkerCount {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.parse::<usize>()?;
        Ok(Self::new(value).unwrap_or(Self::DEFAULT))
    }
}

nonzero_newtype! {
    /// A non-zero consecutive-failure threshold
    ///
    /// The ring keeps trying to reconnect a backend while its failure counter
    /// is below this value; after that the backend is dropped for good.
    ///
    /// # Examples
    /// ```
    /// use driftwatch::types::MaxFailures;
    ///
    /// let max = MaxFailures::new(3).unwrap();
    /// assert_eq!(max.get(), 3);
    /// assert!(MaxFailures::new(0).is_none());
    /// ```
    pub struct MaxFailures(NonZeroU32: u32, serialize as serialize_u32);
}

impl MaxFailures {
    /// Default maximum failures before a backend is abandoned
    pub const DEFAULT: Self = Self(NonZeroU32::new(3).unwrap());
}
