//! Child-side half of the launch protocol. The runsit binary is dual-purpose:
//! when `_RUNSIT_LAUNCH_INFO` is present the process is a freshly spawned
//! helper whose only job is to apply the launch request and replace itself
//! with the target binary. This runs before flag parsing and before the
//! runtime exists, so no supervisor state is ever constructed in the child.

use crate::tasks::launch::{self, LaunchRequest};
use anyhow::Context as _;
use nix::sys::resource::{Resource, setrlimit};
use nix::unistd::{Gid, Uid, chdir, execve, setgid, setgroups, setuid};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt as _;

/// Call first thing in main. Returns normally when the process is the
/// supervisor; in helper mode it never returns.
pub fn maybe_become_child() {
    let payload = match std::env::var(launch::LAUNCH_INFO_ENV) {
        Ok(v) => v,
        Err(_) => return,
    };
    if let Err(e) = become_child(&payload) {
        eprintln!("runsit helper: {e:#}");
        std::process::exit(1);
    }
    // exec fell through without reporting an error; that would be a bug.
    std::process::exit(2);
}

fn become_child(payload: &str) -> anyhow::Result<()> {
    let lr = LaunchRequest::decode(payload).context("decode launch request")?;

    if lr.num_files != 0 {
        setrlimit(Resource::RLIMIT_NOFILE, lr.num_files, lr.num_files)
            .with_context(|| format!("set NOFILE rlimit to {}", lr.num_files))?;
    }
    // gid before uid: after the uid change we may no longer be allowed to
    // change groups.
    if lr.gid != 0 {
        setgid(Gid::from_raw(lr.gid)).with_context(|| format!("setgid({})", lr.gid))?;
    }
    if !lr.gids.is_empty() {
        let gids: Vec<Gid> = lr.gids.iter().map(|g| Gid::from_raw(*g)).collect();
        if let Err(e) = setgroups(&gids) {
            // Some kernels refuse this for unprivileged helpers; the child can
            // usually still run usefully without supplemental groups.
            eprintln!("runsit helper: setgroups({:?}): {e}", lr.gids);
        }
    }
    if lr.uid != 0 {
        setuid(Uid::from_raw(lr.uid)).with_context(|| format!("setuid({})", lr.uid))?;
    }
    if let Some(dir) = &lr.dir {
        chdir(dir.as_path()).with_context(|| format!("chdir to {}", dir.display()))?;
    }

    let path = CString::new(lr.path.as_os_str().as_bytes()).context("binary path")?;
    let argv: Vec<CString> = lr
        .argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<_, _>>()
        .context("argv")?;
    let env: Vec<CString> = lr
        .env
        .iter()
        .map(|e| CString::new(e.as_bytes()))
        .collect::<Result<_, _>>()
        .context("env")?;

    execve(&path, &argv, &env).with_context(|| format!("exec {}", lr.path.display()))?;
    Ok(())
}
