//! # Store Conflict Classification
//!
//! Maps a store-reported error onto the three outcomes the claim engine acts
//! on.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │   StoreError    │────▶│ ErrorClassifier │────▶│ TransientConflict    │ retry attempt
//! │                 │     │                 │     │ Exhausted            │ nothing left
//! └─────────────────┘     └─────────────────┘     │ Fatal                │ propagate
//!                                                 └──────────────────────┘
//! ```
//!
//! Only PostgreSQL's `serialization_failure` (`40001`) and `deadlock_detected`
//! (`40P01`) are transient. Constraint violations, connectivity loss and every
//! unrecognised failure are fatal.
//!
//! ## Usage
//!
//! ```rust
//! use trail_progress_worker::processing::error_classifier::{
//!     ConflictClass, ErrorClassifier, StandardErrorClassifier,
//! };
//! use trail_progress_worker::store::StoreError;
//!
//! let classifier = StandardErrorClassifier::new();
//! let class = classifier.classify(&StoreError::deadlock("deadlock detected"));
//! assert_eq!(class, ConflictClass::TransientConflict);
//! ```

use serde::{Deserialize, Serialize};

use crate::constants::sqlstate;
use crate::store::StoreError;

/// How the engine should react to a store error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClass {
    /// Two transactions collided; the whole attempt may be retried
    TransientConflict,

    /// Nothing is available to claim; ends the current drain normally
    Exhausted,

    /// Must not be retried automatically
    Fatal,
}

impl ConflictClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ConflictClass::TransientConflict)
    }
}

impl std::fmt::Display for ConflictClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictClass::TransientConflict => write!(f, "transient_conflict"),
            ConflictClass::Exhausted => write!(f, "exhausted"),
            ConflictClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Classification strategy; pure and stateless
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &StoreError) -> ConflictClass;
}

/// SQLSTATE-based classifier used in production
#[derive(Debug, Clone)]
pub struct StandardErrorClassifier {
    transient_codes: Vec<&'static str>,
}

impl Default for StandardErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self {
            transient_codes: vec![sqlstate::SERIALIZATION_FAILURE, sqlstate::DEADLOCK_DETECTED],
        }
    }

    fn is_transient_code(&self, code: &str) -> bool {
        self.transient_codes.iter().any(|known| *known == code)
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &StoreError) -> ConflictClass {
        match error {
            StoreError::NoWorkAvailable(_) => ConflictClass::Exhausted,
            StoreError::Database { code, .. } if self.is_transient_code(code) => {
                ConflictClass::TransientConflict
            }
            StoreError::Database { .. }
            | StoreError::Query(_)
            | StoreError::Connection(_)
            | StoreError::Decode(_) => ConflictClass::Fatal,
        }
    }
}
