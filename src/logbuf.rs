//! Process-wide system log: every supervisor event goes to stderr and into a
//! bounded in-memory byte ring that the admin UI can render. Nothing is
//! persisted; restart of the supervisor loses the ring.

use chrono::Local;
use std::sync::{Mutex, OnceLock};

const SYSTEM_LOG_SIZE: usize = 64 * 1024;

struct LogRing {
    pos: usize,
    full: bool,
    buf: Box<[u8; SYSTEM_LOG_SIZE]>,
}

impl LogRing {
    fn new() -> Self {
        Self {
            pos: 0,
            full: false,
            buf: Box::new([0u8; SYSTEM_LOG_SIZE]),
        }
    }

    fn write(&mut self, mut p: &[u8]) {
        while !p.is_empty() {
            let n = (SYSTEM_LOG_SIZE - self.pos).min(p.len());
            self.buf[self.pos..self.pos + n].copy_from_slice(&p[..n]);
            self.pos += n;
            p = &p[n..];
            if self.pos == SYSTEM_LOG_SIZE {
                self.pos = 0;
                self.full = true;
            }
        }
    }

    fn render(&self) -> String {
        if !self.full {
            return String::from_utf8_lossy(&self.buf[..self.pos]).into_owned();
        }
        let mut s = String::from_utf8_lossy(&self.buf[self.pos..]).into_owned();
        s.push_str(&String::from_utf8_lossy(&self.buf[..self.pos]));
        // The first line was likely cut mid-way when the ring wrapped.
        if let Some(nl) = s.find('\n') {
            s.replace_range(..nl + 1, "");
        }
        format!("...\n{s}")
    }
}

fn ring() -> &'static Mutex<LogRing> {
    static RING: OnceLock<Mutex<LogRing>> = OnceLock::new();
    RING.get_or_init(|| Mutex::new(LogRing::new()))
}

/// Emit one structured event line to stderr and the system log ring.
pub fn log(component: &str, task: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match task {
        Some(t) => format!("{ts} [{component}] task={t} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    let mut g = ring().lock().unwrap_or_else(|p| p.into_inner());
    g.write(line.as_bytes());
    g.write(b"\n");
}

/// Render the ring's contents, oldest first. Once the ring has wrapped, the
/// output starts with "...\n" and the first (likely truncated) line is dropped.
pub fn render() -> String {
    ring().lock().unwrap_or_else(|p| p.into_inner()).render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_everything_until_full() {
        let mut r = LogRing::new();
        r.write(b"hello\nworld\n");
        assert_eq!(r.render(), "hello\nworld\n");
    }

    #[test]
    fn ring_wraps_and_drops_partial_first_line() {
        let mut r = LogRing::new();
        // Lines of 10 bytes each ("line-NNNN\n"); enough to wrap the ring twice.
        let total = (SYSTEM_LOG_SIZE / 10) * 2 + 7;
        for i in 0..total {
            r.write(format!("line-{:04}\n", i % 10_000).as_bytes());
        }
        let s = r.render();
        assert!(s.starts_with("...\n"), "wrapped render must start with ...");
        assert!(s.len() <= SYSTEM_LOG_SIZE + 4);
        // Every remaining line is complete.
        for line in s["...\n".len()..].trim_end_matches('\n').split('\n') {
            assert_eq!(line.len(), 9, "unexpected partial line {line:?}");
        }
        assert!(s.ends_with(&format!("line-{:04}\n", (total - 1) % 10_000)));
    }
}
