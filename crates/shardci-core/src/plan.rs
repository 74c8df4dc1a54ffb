//! Deterministic tranche planning.
//!
//! Each test is assigned to exactly one tranche by a stable hash of its
//! identity, so any runner can compute its own subset from just
//! `(index, count)` with no coordination, and re-running the same commit
//! with the same count reproduces identical partitions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CiError, Result};

/// One partition of the test corpus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TrancheSpec {
    /// 0-based tranche index.
    pub index: usize,

    /// Total number of tranches in the run.
    pub count: usize,
}

impl TrancheSpec {
    /// Create a validated tranche spec.
    pub fn new(index: usize, count: usize) -> Result<Self> {
        if count == 0 || index >= count {
            return Err(CiError::InvalidTranche { index, count });
        }
        Ok(Self { index, count })
    }

    /// Whether `test_id` belongs to this tranche.
    ///
    /// Assignment is a function of the test's identity, not its position,
    /// so reordering the corpus never moves tests between tranches.
    pub fn selects(&self, test_id: &str) -> bool {
        tranche_for(test_id, self.count) == self.index
    }

    /// The subset of `corpus` assigned to this tranche, in corpus order.
    pub fn subset<'a>(&self, corpus: &'a [String]) -> Vec<&'a str> {
        corpus
            .iter()
            .filter(|t| self.selects(t))
            .map(String::as_str)
            .collect()
    }
}

/// Stable tranche assignment for one test identity.
fn tranche_for(test_id: &str, count: usize) -> usize {
    let digest = Sha256::digest(test_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % count as u64) as usize
}

/// Partition the whole corpus into `count` ordered tranches.
///
/// The union of the returned subsets is the corpus exactly once. If
/// `count` exceeds the corpus size, later tranches come back empty and
/// run zero tests.
pub fn plan_corpus(corpus: &[String], count: usize) -> Result<Vec<Vec<String>>> {
    if count == 0 {
        return Err(CiError::InvalidTranche { index: 0, count });
    }
    let mut tranches = vec![Vec::new(); count];
    for test in corpus {
        tranches[tranche_for(test, count)].push(test.clone());
    }
    Ok(tranches)
}
