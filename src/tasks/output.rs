use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Only the most recent lines of an instance's output are kept.
pub const MAX_KEEP_LINES: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    System,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::System => "system",
        }
    }
}

/// One captured line of instance output.
#[derive(Debug)]
pub struct Line {
    pub at: DateTime<Local>,
    pub stream: Stream,
    pub data: String,
    /// True when the source line exceeded the reader's buffer and this record
    /// carries only a prefix of it.
    pub truncated: bool,
}

/// Bounded FIFO of captured output lines, safe for concurrent access.
/// The pipe pumps append while the admin UI snapshots.
#[derive(Debug, Default)]
pub struct TaskOutput {
    lines: Mutex<VecDeque<Arc<Line>>>,
}

impl TaskOutput {
    pub fn add(&self, line: Line) {
        let mut q = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        q.push_back(Arc::new(line));
        if q.len() > MAX_KEEP_LINES {
            q.pop_front();
        }
    }

    /// Point-in-time copy; callers may hold on to it indefinitely.
    pub fn snapshot(&self) -> Vec<Arc<Line>> {
        let q = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        q.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(data: &str) -> Line {
        Line {
            at: Local::now(),
            stream: Stream::Stdout,
            data: data.to_string(),
            truncated: false,
        }
    }

    #[test]
    fn drops_oldest_on_overflow() {
        let out = TaskOutput::default();
        for i in 0..MAX_KEEP_LINES + 3 {
            out.add(line(&format!("l{i}")));
        }
        let snap = out.snapshot();
        assert_eq!(snap.len(), MAX_KEEP_LINES);
        assert_eq!(snap.first().unwrap().data, "l3");
        assert_eq!(snap.last().unwrap().data, format!("l{}", MAX_KEEP_LINES + 2));
    }

    #[test]
    fn snapshot_is_stable_after_further_appends() {
        let out = TaskOutput::default();
        out.add(line("a"));
        let snap = out.snapshot();
        out.add(line("b"));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].data, "a");
    }
}
