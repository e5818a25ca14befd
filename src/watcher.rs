//! Config-directory watcher: turns filesystem events on `*.json` files into
//! update messages for the named tasks, creating tasks through the registry
//! on first sight. Deletions flow through the same path; the task notices the
//! missing file and removes itself.

use crate::logbuf;
use crate::tasks::registry;
use crate::tasks::task::TaskFile;
use anyhow::Context as _;
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Editors tend to emit bursts (truncate+write, rename dances); changes are
/// coalesced per task within this window so a save restarts the child once.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Start watching the config directory. Must be called from within the
/// runtime; the watcher task lives for the life of the process.
pub fn start(config_dir: PathBuf) -> anyhow::Result<()> {
    let config_dir = std::path::absolute(&config_dir)
        .with_context(|| format!("resolving config dir {}", config_dir.display()))?;

    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(ev) => {
            if is_config_change(&ev) {
                for p in ev.paths {
                    let _ = tx.send(p);
                }
            }
        }
        Err(e) => logbuf::log("watch", None, format!("watch error: {e}")),
    })
    .context("create config watcher")?;
    watcher
        .watch(&config_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch config dir {}", config_dir.display()))?;

    let initial = scan(&config_dir)?;
    logbuf::log(
        "watch",
        None,
        format!(
            "watching {} ({} task config(s) present)",
            config_dir.display(),
            initial.len()
        ),
    );

    tokio::spawn(async move {
        // The watcher must outlive the subscription.
        let _watcher = watcher;
        run(config_dir, initial, rx).await;
    });
    Ok(())
}

async fn run(config_dir: PathBuf, initial: BTreeSet<String>, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
    for name in initial {
        dispatch(&config_dir, &name);
    }
    while let Some(path) = rx.recv().await {
        let mut pending = BTreeSet::new();
        if let Some(name) = task_name_for(&path) {
            pending.insert(name);
        }
        // Coalesce the burst.
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(p)) => {
                    if let Some(name) = task_name_for(&p) {
                        pending.insert(name);
                    }
                }
                Ok(None) => return,
                Err(_) => break,
            }
        }
        for name in pending {
            dispatch(&config_dir, &name);
        }
    }
}

fn dispatch(config_dir: &Path, name: &str) {
    let tf = TaskFile::new(name, config_dir.join(format!("{name}.json")));
    registry::get_or_make(name).update(tf);
}

fn is_config_change(ev: &Event) -> bool {
    matches!(
        ev.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Task name for a watched path: the stem of a visible `*.json` file whose
/// name is plain printable ASCII. Everything else (dotfiles, editor
/// leftovers, other extensions) is ignored.
fn task_name_for(path: &Path) -> Option<String> {
    if path.extension().is_none_or(|e| e != "json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty()
        || stem.starts_with('.')
        || !stem.chars().all(|c| c.is_ascii_graphic())
    {
        return None;
    }
    Some(stem.to_string())
}

fn scan(config_dir: &Path) -> anyhow::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let entries = std::fs::read_dir(config_dir)
        .with_context(|| format!("read config dir {}", config_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if let Some(name) = task_name_for(&entry.path()) {
            names.insert(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_json_names_become_tasks() {
        assert_eq!(task_name_for(Path::new("/etc/runsit/web.json")), Some("web".into()));
        assert_eq!(
            task_name_for(Path::new("/etc/runsit/db-primary.json")),
            Some("db-primary".into())
        );
        assert_eq!(task_name_for(Path::new("/etc/runsit/.web.json.swp")), None);
        assert_eq!(task_name_for(Path::new("/etc/runsit/.hidden.json")), None);
        assert_eq!(task_name_for(Path::new("/etc/runsit/notes.txt")), None);
        assert_eq!(task_name_for(Path::new("/etc/runsit/web.json.bak")), None);
    }

    #[test]
    fn scan_lists_existing_configs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("b.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(".c.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("d.yaml"), b"").unwrap();
        let names = scan(dir.path()).unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
