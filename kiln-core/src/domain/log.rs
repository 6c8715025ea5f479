//! Log domain types

use serde::{Deserialize, Serialize};

/// One batch of a run's console output
///
/// Returned by a tail read. A client keeps requesting from `next_line` until
/// `complete` is true; an empty batch with `complete == false` only means
/// the producer has not written anything new yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    /// 1-based line number to request next
    pub next_line: u64,
    /// Run is terminal and every line has been returned
    pub complete: bool,
}
