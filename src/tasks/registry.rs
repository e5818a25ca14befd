//! Process-wide name → Task map. Intentionally global: the design is one
//! supervisor per process, and deletion (from a task's own update handler,
//! when its config file disappears) is the only way a name is freed.

use crate::tasks::task::Task;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

fn map() -> &'static Mutex<HashMap<String, Task>> {
    static TASKS: OnceLock<Mutex<HashMap<String, Task>>> = OnceLock::new();
    TASKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch the named task, creating it (and starting its loop) on first sight.
pub fn get_or_make(name: &str) -> Task {
    let mut m = map().lock().unwrap_or_else(|p| p.into_inner());
    m.entry(name.to_string())
        .or_insert_with(|| Task::new(name))
        .clone()
}

pub fn get(name: &str) -> Option<Task> {
    let m = map().lock().unwrap_or_else(|p| p.into_inner());
    m.get(name).cloned()
}

pub fn remove(name: &str) {
    let mut m = map().lock().unwrap_or_else(|p| p.into_inner());
    m.remove(name);
}

/// Snapshot of all known tasks, name-sorted.
pub fn list() -> Vec<Task> {
    let m = map().lock().unwrap_or_else(|p| p.into_inner());
    let mut ts: Vec<Task> = m.values().cloned().collect();
    ts.sort_by(|a, b| a.name().cmp(b.name()));
    ts
}
