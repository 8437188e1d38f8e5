//! Index generations
//!
//! Every full rebuild writes a fresh generation. Readers pick the active
//! generation once per query through [`GenerationPointer`], so a swap never
//! mixes documents from two generations inside one result set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Monotonically increasing index generation number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexGeneration(u64);

impl IndexGeneration {
    /// The generation seeded by the schema migration
    pub const INITIAL: IndexGeneration = IndexGeneration(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// SQLite stores integers as signed 64-bit values
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("negative generation id {}", value)))
    }
}

impl fmt::Display for IndexGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a generation row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Being written by a rebuild; receives live writes too
    Building,
    /// Served to readers
    Active,
    /// Replaced by a newer generation but kept for in-flight readers
    Retired,
    /// Abandoned rebuild
    Cancelled,
    /// Rows removed
    Purged,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Active => "active",
            Self::Retired => "retired",
            Self::Cancelled => "cancelled",
            Self::Purged => "purged",
        }
    }

    /// Whether live ingestion writes must reach this generation
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Building | Self::Active)
    }
}

impl FromStr for GenerationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "building" => Ok(Self::Building),
            "active" => Ok(Self::Active),
            "retired" => Ok(Self::Retired),
            "cancelled" => Ok(Self::Cancelled),
            "purged" => Ok(Self::Purged),
            other => Err(Error::InvalidInput(format!(
                "unknown generation status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-process pointer to the generation readers should use
///
/// Only the index store and the reindex coordinator hold a handle; the only
/// way to move it is [`GenerationPointer::compare_and_swap`].
#[derive(Debug)]
pub struct GenerationPointer {
    current: AtomicU64,
}

impl GenerationPointer {
    pub fn new(initial: IndexGeneration) -> Self {
        Self {
            current: AtomicU64::new(initial.value()),
        }
    }

    /// Snapshot the active generation
    pub fn load(&self) -> IndexGeneration {
        IndexGeneration(self.current.load(Ordering::Acquire))
    }

    /// Move from `expected` to `next`
    ///
    /// Fails with the generation actually observed when another transition
    /// got there first, or when `next` would move the pointer backwards.
    pub fn compare_and_swap(
        &self,
        expected: IndexGeneration,
        next: IndexGeneration,
    ) -> std::result::Result<(), IndexGeneration> {
        if next <= expected {
            return Err(self.load());
        }
        self.current
            .compare_exchange(
                expected.value(),
                next.value(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(IndexGeneration)
    }
}

impl Default for GenerationPointer {
    fn default() -> Self {
        Self::new(IndexGeneration::INITIAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_compare_and_swap() {
        let pointer = GenerationPointer::default();
        assert_eq!(pointer.load(), IndexGeneration::INITIAL);

        pointer
            .compare_and_swap(IndexGeneration::new(1), IndexGeneration::new(2))
            .unwrap();
        assert_eq!(pointer.load(), IndexGeneration::new(2));

        // Stale expectation
        let err = pointer
            .compare_and_swap(IndexGeneration::new(1), IndexGeneration::new(3))
            .unwrap_err();
        assert_eq!(err, IndexGeneration::new(2));
        assert_eq!(pointer.load(), IndexGeneration::new(2));
    }

    #[test]
    fn test_pointer_never_moves_backwards() {
        let pointer = GenerationPointer::new(IndexGeneration::new(5));
        assert!(
            pointer
                .compare_and_swap(IndexGeneration::new(5), IndexGeneration::new(4))
                .is_err()
        );
        assert_eq!(pointer.load(), IndexGeneration::new(5));
    }

    #[test]
    fn test_only_one_concurrent_swap_wins() {
        let pointer = Arc::new(GenerationPointer::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pointer = Arc::clone(&pointer);
                std::thread::spawn(move || {
                    pointer
                        .compare_and_swap(IndexGeneration::new(1), IndexGeneration::new(2 + i))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            GenerationStatus::Building,
            GenerationStatus::Active,
            GenerationStatus::Retired,
            GenerationStatus::Cancelled,
            GenerationStatus::Purged,
        ] {
            assert_eq!(status.as_str().parse::<GenerationStatus>().unwrap(), status);
        }
        assert!(GenerationStatus::Building.is_live());
        assert!(!GenerationStatus::Retired.is_live());
    }
}
