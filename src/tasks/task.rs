use crate::logbuf;
use crate::tasks::config::TaskConfig;
use crate::tasks::instance::TaskInstance;
use crate::tasks::launch::LaunchRequest;
use crate::tasks::plan::{self, PlanError};
use crate::tasks::registry;
use anyhow::anyhow;
use chrono::{DateTime, Local};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// An instance that lived shorter than this is rate-limited before restart.
pub const MIN_UPTIME: Duration = Duration::from_secs(5);

/// A failed port bind re-applies the same config this much later; the port
/// may have been freed in the meantime.
pub const PORT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How many terminated instances the failure ring retains, oldest first.
pub const KEEP_FAILURES: usize = 5;

/// Restart delay after an instance death: nothing if it ran long enough,
/// otherwise the remainder of the minimum uptime.
pub fn restart_delay(uptime: Duration) -> Duration {
    MIN_UPTIME.saturating_sub(uptime)
}

/// Opaque handle the directory watcher hands to a task: the task's short name
/// plus where its config file lives right now.
#[derive(Debug, Clone)]
pub struct TaskFile {
    name: String,
    path: PathBuf,
}

impl TaskFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Base name without directory prefix or .json suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the current config file contents, or None once deleted.
    pub fn config_path(&self) -> Option<PathBuf> {
        if self.path.exists() {
            Some(self.path.clone())
        } else {
            None
        }
    }
}

pub(crate) enum ControlMessage {
    /// New or changed config file.
    Update(TaskFile),
    /// Graceful stop; replies when done.
    Stop(oneshot::Sender<()>),
    /// Snapshot of current status.
    Status(oneshot::Sender<TaskStatus>),
    /// A child has terminated; its exit record is already set.
    InstanceGone(Arc<TaskInstance>),
    /// Timer-driven restart nudge; a no-op while running or unconfigured.
    RestartIfStopped,
}

#[derive(Debug, Clone)]
pub struct StartError {
    pub msg: String,
    pub at: DateTime<Local>,
}

/// Read-only snapshot of a task for the admin UI, produced inside the loop.
#[derive(Debug)]
pub struct TaskStatus {
    pub running: Option<Arc<TaskInstance>>,
    /// Why the task is not running, with its timestamp.
    pub start_err: Option<StartError>,
    /// Time until the next restart attempt, when rate-limited.
    pub restart_in: Option<Duration>,
    /// Most recent terminated instances, oldest first.
    pub failures: Vec<Arc<TaskInstance>>,
}

impl TaskStatus {
    pub fn summary(&self) -> String {
        if self.running.is_some() {
            return "ok".to_string();
        }
        if let Some(e) = &self.start_err {
            return format!("start error ({} ago): {}", fmt_ago(e.at), e.msg);
        }
        if let Some(d) = self.restart_in {
            return format!("not running; restarting in {}", fmt_duration(d));
        }
        "not running".to_string()
    }
}

pub(crate) fn fmt_ago(at: DateTime<Local>) -> String {
    fmt_duration(Duration::from_secs(
        (Local::now() - at).num_seconds().max(0) as u64,
    ))
}

pub(crate) fn fmt_duration(d: Duration) -> String {
    let mut s = d.as_secs();
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

/// A named, long-lived supervision record. One Task exists for the life of
/// the supervisor no matter how often its child fails and restarts; it goes
/// away only when its config file is deleted. All mutable state lives inside
/// the task's loop, so the handle is freely cloneable.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    control: UnboundedSender<ControlMessage>,
}

impl Task {
    pub(crate) fn new(name: &str) -> Self {
        let (tx, rx) = unbounded_channel();
        let task = Self {
            name: name.to_string(),
            control: tx.clone(),
        };
        tokio::spawn(task_loop(name.to_string(), tx, rx));
        task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a config update. Messages to a deleted task are dropped.
    pub fn update(&self, tf: TaskFile) {
        let _ = self.control.send(ControlMessage::Update(tf));
    }

    /// Stop the running instance (if any) and wait for the loop to confirm.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(ControlMessage::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Status snapshot via the loop, or None if the task has been deleted.
    pub async fn status(&self) -> Option<TaskStatus> {
        let (tx, rx) = oneshot::channel();
        self.control.send(ControlMessage::Status(tx)).ok()?;
        rx.await.ok()
    }
}

/// State owned exclusively by the task's loop; nothing here needs a lock.
struct LoopState {
    name: String,
    tx: UnboundedSender<ControlMessage>,
    /// Handle to the config file, retained for the port-bind retry.
    tf: Option<TaskFile>,
    /// Last valid parsed config. A failed re-parse leaves this untouched.
    config: Option<TaskConfig>,
    start_err: Option<StartError>,
    running: Option<Arc<TaskInstance>>,
    failures: VecDeque<Arc<TaskInstance>>,
    restart_at: Option<Instant>,
}

async fn task_loop(
    name: String,
    tx: UnboundedSender<ControlMessage>,
    mut rx: UnboundedReceiver<ControlMessage>,
) {
    logbuf::log("task", Some(&name), "starting");
    let mut st = LoopState {
        name,
        tx,
        tf: None,
        config: None,
        start_err: None,
        running: None,
        failures: VecDeque::new(),
        restart_at: None,
    };

    loop {
        // The only suspension point: wait for the next message, or synthesize
        // a restart nudge when the cooldown deadline passes.
        let msg = if let Some(at) = st.restart_at {
            tokio::select! {
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
                _ = tokio::time::sleep_until(at) => {
                    st.restart_at = None;
                    ControlMessage::RestartIfStopped
                }
            }
        } else {
            match rx.recv().await {
                Some(m) => m,
                None => break,
            }
        };

        match msg {
            ControlMessage::Update(tf) => {
                if st.handle_update(tf).await {
                    break;
                }
            }
            ControlMessage::Stop(reply) => {
                st.handle_stop();
                let _ = reply.send(());
            }
            ControlMessage::Status(reply) => {
                let _ = reply.send(st.status());
            }
            ControlMessage::InstanceGone(inst) => st.handle_instance_gone(inst),
            ControlMessage::RestartIfStopped => st.handle_restart_if_stopped().await,
        }
    }
    logbuf::log("task", Some(&st.name), "loop exiting");
}

impl LoopState {
    /// Returns true when the task should disappear (config file deleted).
    async fn handle_update(&mut self, tf: TaskFile) -> bool {
        // Any update takes down the old world before trying the new one.
        self.stop_running();

        let Some(path) = tf.config_path() else {
            logbuf::log("task", Some(&self.name), "config file deleted; removing task");
            registry::remove(&self.name);
            return true;
        };
        self.tf = Some(tf);

        match TaskConfig::load(&path) {
            Err(e) => {
                self.record_error(format!("bad config file: {e:#}"));
            }
            Ok(cfg) => {
                self.start_err = None;
                self.config = Some(cfg);
                self.start_retained().await;
            }
        }
        false
    }

    /// Plan and spawn from the retained config. Planning does synchronous
    /// stats, lookups and binds, so it runs on the blocking pool; the loop
    /// still processes nothing else meanwhile, keeping mutations serialised.
    async fn start_retained(&mut self) {
        let Some(cfg) = self.config.clone() else {
            return;
        };
        let name = self.name.clone();
        let joined = tokio::task::spawn_blocking(
            move || -> Result<(TaskConfig, LaunchRequest, Child), PlanError> {
                let plan = plan::plan(&name, &cfg)?;
                let child = plan
                    .lr
                    .start(&plan.port_fds)
                    .map_err(|e| PlanError::Start(anyhow!("spawning helper: {e}")))?;
                // port_fds drop here; the child owns its inherited copies now.
                Ok((cfg, plan.lr, child))
            },
        )
        .await;

        let res = match joined {
            Ok(r) => r,
            Err(e) => {
                self.record_error(format!("start error: launch worker died: {e}"));
                return;
            }
        };
        match res {
            Ok((cfg, lr, child)) => {
                let pid = child.id() as i32;
                let inst = Arc::new(TaskInstance::new(&self.name, cfg, lr, pid));
                inst.start_workers(child, self.tx.clone());
                logbuf::log("task", Some(&self.name), format!("started with pid {pid}"));
                self.running = Some(inst);
            }
            Err(e @ PlanError::PortBind { .. }) => {
                self.record_error(format!("{e}; retrying in {}", fmt_duration(PORT_RETRY_DELAY)));
                self.schedule_reupdate();
            }
            Err(e) => self.record_error(e.to_string()),
        }
    }

    fn schedule_reupdate(&self) {
        let Some(tf) = self.tf.clone() else {
            return;
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PORT_RETRY_DELAY).await;
            let _ = tx.send(ControlMessage::Update(tf));
        });
    }

    /// Kill the current instance's entire process group. The reaper's
    /// instance-gone message for it arrives later and is handled normally.
    fn stop_running(&mut self) {
        let Some(inst) = self.running.take() else {
            return;
        };
        inst.note("sending SIGKILL to process group");
        let r = kill(Pid::from_raw(-inst.pid()), Signal::SIGKILL);
        inst.note(format!("kill result: {r:?}"));
    }

    /// External stop: the task stays down until the next update, so the
    /// retained config goes too; otherwise the pending instance-gone would
    /// schedule a restart that resurrects it.
    fn handle_stop(&mut self) {
        self.stop_running();
        self.restart_at = None;
        self.config = None;
    }

    fn handle_instance_gone(&mut self, inst: Arc<TaskInstance>) {
        let (uptime, desc) = match inst.exit() {
            Some(e) => (e.uptime, e.result.to_string()),
            None => (Duration::ZERO, "no exit record".to_string()),
        };
        inst.note(format!("task exited; {desc}"));

        if let Some(cur) = &self.running {
            if Arc::ptr_eq(cur, &inst) {
                self.running = None;
            }
        }
        if self.failures.len() == KEEP_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(inst);

        self.restart_at = Some(Instant::now() + restart_delay(uptime));
    }

    async fn handle_restart_if_stopped(&mut self) {
        if self.running.is_some() {
            return;
        }
        // A recorded config/start error is sticky: no retry until a new
        // update arrives.
        if self.config.is_none() || self.start_err.is_some() {
            return;
        }
        logbuf::log("task", Some(&self.name), "restarting");
        self.start_retained().await;
    }

    fn status(&self) -> TaskStatus {
        TaskStatus {
            running: self.running.clone(),
            start_err: if self.running.is_none() {
                self.start_err.clone()
            } else {
                None
            },
            restart_in: self
                .restart_at
                .map(|at| at.saturating_duration_since(Instant::now()))
                .filter(|d| !d.is_zero()),
            failures: self.failures.iter().cloned().collect(),
        }
    }

    fn record_error(&mut self, msg: String) {
        logbuf::log("task", Some(&self.name), &msg);
        self.start_err = Some(StartError {
            msg,
            at: Local::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_state() -> (LoopState, UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = unbounded_channel();
        (
            LoopState {
                name: "unit".to_string(),
                tx,
                tf: None,
                config: None,
                start_err: None,
                running: None,
                failures: VecDeque::new(),
                restart_at: None,
            },
            rx,
        )
    }

    fn dead_instance(n: usize) -> Arc<TaskInstance> {
        let cfg = TaskConfig::parse(br#"{"binary":"/bin/true"}"#).unwrap();
        let lr = LaunchRequest {
            path: "/bin/true".into(),
            argv: vec!["true".into()],
            ..Default::default()
        };
        Arc::new(TaskInstance::new("unit", cfg, lr, 1000 + n as i32))
    }

    #[test]
    fn failure_ring_keeps_at_most_five_dropping_oldest() {
        let (mut st, _rx) = loop_state();
        let instances: Vec<_> = (0..KEEP_FAILURES + 2).map(dead_instance).collect();
        for inst in &instances {
            st.handle_instance_gone(Arc::clone(inst));
        }
        assert_eq!(st.failures.len(), KEEP_FAILURES);
        // Oldest first; the first two were dropped.
        assert!(Arc::ptr_eq(&st.failures[0], &instances[2]));
        assert!(Arc::ptr_eq(st.failures.back().unwrap(), instances.last().unwrap()));
        assert!(st.restart_at.is_some(), "death schedules a restart nudge");
    }

    #[test]
    fn instance_gone_clears_running_only_for_the_dying_instance() {
        let (mut st, _rx) = loop_state();
        let old = dead_instance(1);
        let new = dead_instance(2);
        st.running = Some(Arc::clone(&new));
        // The old instance's death must not clobber the replacement.
        st.handle_instance_gone(old);
        assert!(st.running.is_some());
        st.handle_instance_gone(Arc::clone(&new));
        assert!(st.running.is_none());
    }

    #[test]
    fn stop_clears_cooldown_and_retained_config() {
        let (mut st, _rx) = loop_state();
        st.config = Some(TaskConfig::parse(br#"{"binary":"/bin/true"}"#).unwrap());
        st.restart_at = Some(Instant::now() + Duration::from_secs(5));
        st.handle_stop();
        assert!(st.running.is_none());
        assert!(st.restart_at.is_none());
        assert!(st.config.is_none(), "a stopped task stays down until updated");
    }

    #[test]
    fn restart_delay_fills_out_minimum_uptime() {
        assert_eq!(restart_delay(Duration::ZERO), MIN_UPTIME);
        assert_eq!(
            restart_delay(Duration::from_secs(2)),
            Duration::from_secs(3)
        );
        assert_eq!(restart_delay(Duration::from_secs(5)), Duration::ZERO);
        assert_eq!(restart_delay(Duration::from_secs(60)), Duration::ZERO);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(fmt_duration(Duration::from_secs(4)), "4s");
        assert_eq!(fmt_duration(Duration::from_secs(75)), "1m15s");
        assert_eq!(fmt_duration(Duration::from_secs(3_700)), "1h01m");
        assert_eq!(fmt_duration(Duration::from_secs(90_000)), "1d01h");
    }

    #[test]
    fn summary_prefers_running_then_error_then_cooldown() {
        let ok = TaskStatus {
            running: None,
            start_err: None,
            restart_in: None,
            failures: vec![],
        };
        assert_eq!(ok.summary(), "not running");

        let cooling = TaskStatus {
            restart_in: Some(Duration::from_secs(3)),
            ..ok
        };
        assert_eq!(cooling.summary(), "not running; restarting in 3s");

        let erred = TaskStatus {
            running: None,
            start_err: Some(StartError {
                msg: "bad config file: boom".into(),
                at: Local::now(),
            }),
            restart_in: None,
            failures: vec![],
        };
        assert!(erred.summary().starts_with("start error ("));
        assert!(erred.summary().ends_with("bad config file: boom"));
    }

    #[test]
    fn task_file_reports_deletion() {
        let tf = TaskFile::new("ghost", "/no/such/dir/ghost.json");
        assert_eq!(tf.name(), "ghost");
        assert!(tf.config_path().is_none());
    }
}
