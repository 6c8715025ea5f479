//! Log Sink
//!
//! Per-run, append-only console output addressed by 1-based line numbers.
//!
//! While a run is active its lines live in memory. The run controller is the
//! only producer; any number of readers poll with `read`. When the run ends
//! the buffer is flushed to `logs/<run>.log` and evicted, after which reads
//! are served from the file.

use kiln_core::domain::log::LogTail;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::storage::DataLayout;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("no log for run {0}")]
    NotFound(Uuid),
    #[error("log buffer of run {0} is already complete")]
    Closed(Uuid),
    #[error("flushing log of run {0} timed out")]
    FlushTimeout(Uuid),
    #[error("log storage error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Default)]
struct Buffer {
    lines: Vec<String>,
    complete: bool,
}

/// In-memory log buffers of active runs, backed by flushed files
pub struct LogSink {
    layout: DataLayout,
    buffers: Mutex<HashMap<Uuid, Arc<Mutex<Buffer>>>>,
}

impl LogSink {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an empty buffer for a run about to start
    pub fn open(&self, run_id: Uuid) {
        let mut buffers = lock(&self.buffers);
        buffers.entry(run_id).or_default();
    }

    /// Appends lines to an open buffer
    ///
    /// Entries holding line breaks are split so every stored entry is exactly
    /// one line of the flushed file. Only the per-run lock is taken, and
    /// readers hold it just long enough to clone a slice.
    pub fn append<I>(&self, run_id: Uuid, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let buffer = self.buffer(run_id).ok_or(LogError::NotFound(run_id))?;
        let mut buffer = lock(&buffer);
        if buffer.complete {
            return Err(LogError::Closed(run_id));
        }
        for entry in lines {
            if entry.contains(['\n', '\r']) {
                buffer.lines.extend(split_lines(&entry));
            } else {
                buffer.lines.push(entry);
            }
        }
        Ok(())
    }

    /// Reads up to `max_lines` lines starting at `from_line` (1-based)
    pub async fn read(&self, run_id: Uuid, from_line: u64, max_lines: usize) -> Result<LogTail> {
        let from_line = from_line.max(1);

        if let Some(buffer) = self.buffer(run_id) {
            // Lines and the completion flag are read under the same lock so
            // `complete` can never be reported while lines are still pending
            let buffer = lock(&buffer);
            return Ok(slice(&buffer.lines, buffer.complete, from_line, max_lines));
        }

        match tokio::fs::read_to_string(self.layout.log_file(run_id)).await {
            Ok(content) => {
                let lines: Vec<String> = content.lines().map(str::to_string).collect();
                Ok(slice(&lines, true, from_line, max_lines))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LogError::NotFound(run_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Refuses further appends; readers see `complete` once they catch up
    pub fn close(&self, run_id: Uuid) {
        if let Some(buffer) = self.buffer(run_id) {
            lock(&buffer).complete = true;
        }
    }

    /// Marks the log complete, flushes it to disk and evicts the buffer
    ///
    /// If the flush fails or times out the buffer stays in memory, so the log
    /// remains readable for the lifetime of the process.
    pub async fn finish(&self, run_id: Uuid, flush_timeout: Duration) -> Result<()> {
        let buffer = self.buffer(run_id).ok_or(LogError::NotFound(run_id))?;
        let content = {
            let mut buffer = lock(&buffer);
            buffer.complete = true;
            let mut content = buffer.lines.join("\n");
            if !buffer.lines.is_empty() {
                content.push('\n');
            }
            content
        };

        let path = self.layout.log_file(run_id);
        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await
        };

        match tokio::time::timeout(flush_timeout, write).await {
            Ok(Ok(())) => {
                lock(&self.buffers).remove(&run_id);
                tracing::debug!("Flushed log of run {} to {}", run_id, path.display());
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LogError::FlushTimeout(run_id)),
        }
    }

    fn buffer(&self, run_id: Uuid) -> Option<Arc<Mutex<Buffer>>> {
        lock(&self.buffers).get(&run_id).cloned()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Splits an entry the way `str::lines` splits the flushed file
fn split_lines(entry: &str) -> impl Iterator<Item = String> + '_ {
    entry
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
}

fn slice(lines: &[String], complete: bool, from_line: u64, max_lines: usize) -> LogTail {
    let start = usize::try_from(from_line - 1).unwrap_or(usize::MAX).min(lines.len());
    let end = start.saturating_add(max_lines).min(lines.len());
    let batch = lines[start..end].to_vec();
    let next_line = from_line + batch.len() as u64;

    LogTail {
        lines: batch,
        next_line,
        complete: complete && end == lines.len(),
    }
}

/// Locks a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
        range.map(|i| format!("line {}", i)).collect()
    }

    fn sink() -> (tempfile::TempDir, LogSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(DataLayout::new(dir.path()));
        (dir, sink)
    }

    #[tokio::test]
    async fn test_read_returns_all_lines_in_order() {
        let (_dir, sink) = sink();
        let run = Uuid::new_v4();
        sink.open(run);

        sink.append(run, lines(1..=3)).unwrap();
        sink.append(run, lines(4..=5)).unwrap();
        sink.append(run, Vec::new()).unwrap();
        sink.append(run, lines(6..=10)).unwrap();
        sink.finish(run, Duration::from_secs(5)).await.unwrap();

        let tail = sink.read(run, 1, 1_000).await.unwrap();
        assert_eq!(tail.lines, lines(1..=10));
        assert_eq!(tail.next_line, 11);
        assert!(tail.complete);
    }

    #[tokio::test]
    async fn test_polling_is_gap_free() {
        let (_dir, sink) = sink();
        let run = Uuid::new_v4();
        sink.open(run);

        let mut seen = Vec::new();
        let mut next = 1;

        let tail = sink.read(run, next, 2).await.unwrap();
        assert!(tail.lines.is_empty());
        assert!(!tail.complete);
        assert_eq!(tail.next_line, 1);

        sink.append(run, lines(1..=5)).unwrap();
        loop {
            let tail = sink.read(run, next, 2).await.unwrap();
            if tail.lines.is_empty() {
                assert!(!tail.complete);
                break;
            }
            seen.extend(tail.lines);
            next = tail.next_line;
        }

        sink.append(run, lines(6..=7)).unwrap();
        sink.finish(run, Duration::from_secs(5)).await.unwrap();
        loop {
            let tail = sink.read(run, next, 2).await.unwrap();
            seen.extend(tail.lines);
            next = tail.next_line;
            if tail.complete {
                break;
            }
        }

        assert_eq!(seen, lines(1..=7));
        assert_eq!(next, 8);
    }

    #[tokio::test]
    async fn test_complete_not_reported_while_lines_remain() {
        let (_dir, sink) = sink();
        let run = Uuid::new_v4();
        sink.open(run);
        sink.append(run, lines(1..=4)).unwrap();
        sink.finish(run, Duration::from_secs(5)).await.unwrap();

        let tail = sink.read(run, 1, 3).await.unwrap();
        assert_eq!(tail.lines.len(), 3);
        assert!(!tail.complete);

        let tail = sink.read(run, tail.next_line, 3).await.unwrap();
        assert_eq!(tail.lines, vec!["line 4".to_string()]);
        assert!(tail.complete);
    }

    #[tokio::test]
    async fn test_finish_evicts_and_falls_back_to_file() {
        let (dir, sink) = sink();
        let run = Uuid::new_v4();
        sink.open(run);
        sink.append(run, lines(1..=2)).unwrap();
        sink.finish(run, Duration::from_secs(5)).await.unwrap();

        assert!(!lock(&sink.buffers).contains_key(&run));
        let on_disk = std::fs::read_to_string(DataLayout::new(dir.path()).log_file(run)).unwrap();
        assert_eq!(on_disk, "line 1\nline 2\n");

        // A reader arriving later drains history and sees completion at once
        let tail = sink.read(run, 1, 10).await.unwrap();
        assert_eq!(tail.lines, lines(1..=2));
        assert!(tail.complete);

        let past_end = sink.read(run, 50, 10).await.unwrap();
        assert!(past_end.lines.is_empty());
        assert_eq!(past_end.next_line, 50);
        assert!(past_end.complete);
    }

    #[tokio::test]
    async fn test_multiline_entries_keep_offsets_across_flush() {
        let (_dir, sink) = sink();
        let run = Uuid::new_v4();
        sink.open(run);
        sink.append(
            run,
            vec!["a".to_string(), "b\nc".to_string(), "d\r\n".to_string()],
        )
        .unwrap();

        let head = sink.read(run, 1, 2).await.unwrap();
        assert_eq!(head.lines, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(head.next_line, 3);

        sink.finish(run, Duration::from_secs(5)).await.unwrap();

        let rest = sink.read(run, head.next_line, 10).await.unwrap();
        assert_eq!(rest.lines, vec!["c".to_string(), "d".to_string(), String::new()]);
        assert_eq!(rest.next_line, 6);
        assert!(rest.complete);

        let whole = sink.read(run, 1, 100).await.unwrap();
        assert_eq!(whole.lines.len() as u64 + 1, whole.next_line);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (_dir, sink) = sink();
        let run = Uuid::new_v4();

        assert!(matches!(sink.read(run, 1, 10).await, Err(LogError::NotFound(_))));
        assert!(matches!(
            sink.append(run, lines(1..=1)),
            Err(LogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_log_flushes_empty_file() {
        let (_dir, sink) = sink();
        let run = Uuid::new_v4();
        sink.open(run);
        sink.finish(run, Duration::from_secs(5)).await.unwrap();

        let tail = sink.read(run, 1, 10).await.unwrap();
        assert!(tail.lines.is_empty());
        assert_eq!(tail.next_line, 1);
        assert!(tail.complete);
    }
}
