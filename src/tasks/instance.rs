use crate::logbuf;
use crate::tasks::config::TaskConfig;
use crate::tasks::launch::LaunchRequest;
use crate::tasks::output::{Line, Stream, TaskOutput};
use crate::tasks::task::ControlMessage;
use chrono::{DateTime, Local};
use std::fmt;
use std::io::{BufRead as _, BufReader, Read};
use std::os::unix::process::ExitStatusExt as _;
use std::process::Child;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Longest captured line; longer source lines are delivered as truncated
/// prefix records.
const MAX_LINE_BYTES: usize = 4096;

/// How one instance's wait() came out. Clean exit is still a supervision
/// failure for a daemon, but status renders it differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Clean,
    Exited(i32),
    Signaled(i32),
    WaitFailed(String),
}

impl WaitResult {
    pub fn is_clean(&self) -> bool {
        matches!(self, WaitResult::Clean)
    }
}

impl fmt::Display for WaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitResult::Clean => write!(f, "clean exit"),
            WaitResult::Exited(code) => write!(f, "exit status {code}"),
            WaitResult::Signaled(sig) => write!(f, "killed by signal {sig}"),
            WaitResult::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

#[derive(Debug)]
pub struct ExitInfo {
    pub at: DateTime<Local>,
    pub uptime: Duration,
    pub result: WaitResult,
}

/// One attempted/actual run of a task's binary. Construction parameters are
/// fixed at birth; the exit fields are written exactly once by the reaper.
#[derive(Debug)]
pub struct TaskInstance {
    task_name: String,
    pub start_time: DateTime<Local>,
    started: Instant,
    /// Config snapshot that produced this instance.
    pub config: TaskConfig,
    pub lr: LaunchRequest,
    pid: i32,
    output: TaskOutput,
    exit: OnceLock<ExitInfo>,
}

impl TaskInstance {
    pub(crate) fn new(task_name: &str, config: TaskConfig, lr: LaunchRequest, pid: i32) -> Self {
        Self {
            task_name: task_name.to_string(),
            start_time: Local::now(),
            started: Instant::now(),
            config,
            lr,
            pid,
            output: TaskOutput::default(),
            exit: OnceLock::new(),
        }
    }

    /// Stable human identifier: task name, start epoch, pid.
    pub fn id(&self) -> String {
        format!(
            "{:?}/{}-pid{}",
            self.task_name,
            self.start_time.timestamp(),
            self.pid
        )
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        match self.exit.get() {
            Some(e) => e.uptime,
            None => self.started.elapsed(),
        }
    }

    pub fn exit(&self) -> Option<&ExitInfo> {
        self.exit.get()
    }

    /// Snapshot copy of the captured output lines.
    pub fn output(&self) -> Vec<Arc<Line>> {
        self.output.snapshot()
    }

    /// Append a system-stream line to this instance's output and to the
    /// process-wide log.
    pub fn note(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        self.output.add(Line {
            at: Local::now(),
            stream: Stream::System,
            data: msg.to_string(),
            truncated: false,
        });
        logbuf::log("task", Some(&self.task_name), format!("{}: {msg}", self.id()));
    }

    fn add_line(&self, stream: Stream, data: String, truncated: bool) {
        self.output.add(Line {
            at: Local::now(),
            stream,
            data,
            truncated,
        });
    }

    /// Start the three per-instance workers: one pump per output pipe and the
    /// reaper that waits for the exit and posts it back to the task loop.
    pub(crate) fn start_workers(
        self: &Arc<Self>,
        mut child: Child,
        control: UnboundedSender<ControlMessage>,
    ) {
        if let Some(out) = child.stdout.take() {
            let inst = Arc::clone(self);
            std::thread::spawn(move || pump(inst, Stream::Stdout, out));
        }
        if let Some(err) = child.stderr.take() {
            let inst = Arc::clone(self);
            std::thread::spawn(move || pump(inst, Stream::Stderr, err));
        }
        let inst = Arc::clone(self);
        std::thread::spawn(move || reap(inst, child, control));
    }
}

/// Drain one output pipe line by line, tagging each record with its stream.
/// Lines longer than the buffer arrive as truncated prefix chunks.
fn pump(inst: Arc<TaskInstance>, stream: Stream, r: impl Read) {
    let mut br = BufReader::new(r);
    let mut buf: Vec<u8> = Vec::with_capacity(MAX_LINE_BYTES);
    loop {
        buf.clear();
        let n = match (&mut br)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
        {
            Ok(0) => return, // EOF; not worth logging about
            Ok(n) => n,
            Err(e) => {
                inst.note(format!("pipe {:?} closed: {e}", stream.as_str()));
                return;
            }
        };
        let truncated = n == MAX_LINE_BYTES && !buf.ends_with(b"\n");
        while matches!(buf.last(), Some(&b'\n') | Some(&b'\r')) {
            buf.pop();
        }
        inst.add_line(stream, String::from_utf8_lossy(&buf).into_owned(), truncated);
    }
}

/// Block on the child's wait, record the outcome once, then tell the loop.
fn reap(inst: Arc<TaskInstance>, mut child: Child, control: UnboundedSender<ControlMessage>) {
    let result = match child.wait() {
        Ok(status) => {
            if status.success() {
                WaitResult::Clean
            } else if let Some(sig) = status.signal() {
                WaitResult::Signaled(sig)
            } else {
                WaitResult::Exited(status.code().unwrap_or(-1))
            }
        }
        Err(e) => WaitResult::WaitFailed(e.to_string()),
    };
    let _ = inst.exit.set(ExitInfo {
        at: Local::now(),
        uptime: inst.started.elapsed(),
        result,
    });
    let _ = control.send(ControlMessage::InstanceGone(inst));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> TaskInstance {
        let cfg = TaskConfig::parse(br#"{"binary":"/bin/true"}"#).unwrap();
        let lr = LaunchRequest {
            path: "/bin/true".into(),
            argv: vec!["true".into()],
            ..Default::default()
        };
        TaskInstance::new("demo", cfg, lr, 4321)
    }

    #[test]
    fn id_carries_name_epoch_and_pid() {
        let inst = instance();
        let id = inst.id();
        assert!(id.starts_with("\"demo\"/"));
        assert!(id.ends_with("-pid4321"));
    }

    #[test]
    fn note_lands_in_output_as_system_line() {
        let inst = instance();
        inst.note("started with pid 4321");
        let out = inst.output();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream, Stream::System);
        assert_eq!(out[0].data, "started with pid 4321");
    }

    #[test]
    fn pump_splits_and_flags_long_lines() {
        let inst = Arc::new(instance());
        let long = "x".repeat(MAX_LINE_BYTES + 10);
        let input = format!("short\n{long}\nafter\n");
        pump(Arc::clone(&inst), Stream::Stdout, input.as_bytes());
        let out = inst.output();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].data, "short");
        assert!(!out[0].truncated);
        assert_eq!(out[1].data.len(), MAX_LINE_BYTES);
        assert!(out[1].truncated);
        assert_eq!(out[2].data.len(), 10);
        assert!(!out[2].truncated);
        assert_eq!(out[3].data, "after");
    }

    #[test]
    fn wait_result_renders() {
        assert_eq!(WaitResult::Clean.to_string(), "clean exit");
        assert_eq!(WaitResult::Exited(1).to_string(), "exit status 1");
        assert_eq!(WaitResult::Signaled(9).to_string(), "killed by signal 9");
    }
}
