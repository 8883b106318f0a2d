//! Outcome of a single export or processing attempt.

use serde::{Deserialize, Serialize};

/// Result of handing one object to a stage's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// The object was delivered; release it.
    Ok,
    /// Transient failure (remote down, disk full). Requeue at the tail.
    Retry,
    /// The object itself is unacceptable. Quarantine it, or delete it when
    /// the stage has no quarantine.
    Fail,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Retry => write!(f, "RETRY"),
            Status::Fail => write!(f, "FAIL"),
        }
    }
}
