use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use thiserror::Error;

/// Presence of this variable switches a freshly exec'd runsit binary into
/// child-bootstrap mode (see `bootstrap`). The value is
/// base64(JSON(LaunchRequest)). It is not inherited past the final exec: the
/// exec's environment is `env`, which never contains it.
pub const LAUNCH_INFO_ENV: &str = "_RUNSIT_LAUNCH_INFO";

/// Per-port env entry telling the child which inherited fd carries which
/// pre-opened listener: `RUNSIT_PORTFD_<name>=<fd>`, fds dense from 3.
pub const PORT_FD_ENV_PREFIX: &str = "RUNSIT_PORTFD_";

/// First fd slot handed to the child after stdio.
pub const FIRST_EXTRA_FD: RawFd = 3;

/// Everything a helper child needs to become the target process. Immutable
/// once built; shipped to the re-exec'd helper through `LAUNCH_INFO_ENV`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Target uid, or 0 to leave unchanged.
    pub uid: u32,
    /// Primary gid, or 0 to leave unchanged.
    pub gid: u32,
    /// Supplemental gids.
    pub gids: Vec<u32>,
    /// Absolute path of the target binary.
    pub path: PathBuf,
    /// Child environment as NAME=value entries.
    pub env: Vec<String>,
    /// argv[0] is the basename of `path`.
    pub argv: Vec<String>,
    /// Working directory; chdir happens only when set.
    pub dir: Option<PathBuf>,
    /// New nofile rlimit (soft and hard), or 0 to leave unchanged.
    pub num_files: u64,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("launch payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("launch payload does not decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LaunchRequest {
    /// Serialise into a textually safe payload for an environment variable.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("LaunchRequest serializes");
        BASE64.encode(json)
    }

    /// Inverse of `encode`.
    pub fn decode(s: &str) -> Result<Self, CodecError> {
        let raw = BASE64.decode(s.trim().as_bytes())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Spawn the helper child: re-execute our own binary with only the launch
    /// payload in its environment. The helper applies rlimit/gid/uid/chdir and
    /// execs the target (see `bootstrap`). Each extra file lands on fd 3+i in
    /// the child; the caller keeps the originals open until this returns.
    ///
    /// The child gets its own process group so a later kill of the negated
    /// pid takes the whole tree down with it.
    pub fn start(&self, extra_files: &[OwnedFd]) -> io::Result<Child> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.env_clear();
        cmd.env(LAUNCH_INFO_ENV, self.encode());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.process_group(0);

        if !extra_files.is_empty() {
            // The parked source fds sit above FD_PARK_MIN (see plan.rs), so the
            // dup2 targets 3+i never collide with a source.
            let raw: Vec<RawFd> = extra_files.iter().map(|f| f.as_raw_fd()).collect();
            unsafe {
                cmd.pre_exec(move || {
                    for (i, fd) in raw.iter().enumerate() {
                        let rc = unsafe { libc::dup2(*fd, FIRST_EXTRA_FD + i as RawFd) };
                        if rc < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        cmd.spawn()
    }
}
