//! Log DTOs for inter-service communication

use serde::{Deserialize, Serialize};

/// Default number of lines returned by one tail request
pub const DEFAULT_TAIL_LINES: u32 = 500;

/// Query parameters of a log tail request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TailQuery {
    /// 1-based starting line, defaults to 1
    pub from_line: Option<u64>,
    pub max_lines: Option<u32>,
}

impl TailQuery {
    pub fn from_line(&self) -> u64 {
        self.from_line.unwrap_or(1).max(1)
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines.unwrap_or(DEFAULT_TAIL_LINES).clamp(1, 5_000) as usize
    }
}
