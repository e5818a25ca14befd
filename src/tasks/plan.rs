use crate::logbuf;
use crate::tasks::config::{Port, TaskConfig};
use crate::tasks::launch::{FIRST_EXTRA_FD, LaunchRequest, PORT_FD_ENV_PREFIX};
use anyhow::anyhow;
use nix::fcntl::{FcntlArg, fcntl};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/bin:/usr/sbin:/sbin:/bin";

/// Parked listener fds live above this slot so the child-side dup2 down to
/// 3+i can never collide with a source fd.
const FD_PARK_MIN: i32 = 64;

#[derive(Debug, Error)]
pub enum PlanError {
    /// The retained config is invalid; the task stays stopped with no retry
    /// until a new update arrives.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
    /// The config is valid but this start attempt failed.
    #[error("start error: {0:#}")]
    Start(anyhow::Error),
    /// A listener could not be bound. The port may free up later, so the task
    /// schedules one delayed re-apply of the same config file.
    #[error("port {name:?} listen error: {source}")]
    PortBind {
        name: String,
        source: std::io::Error,
    },
}

/// A fully planned launch: the request to ship to the helper plus the parked
/// listener fds the parent must keep open until the child has been spawned.
#[derive(Debug)]
pub struct Plan {
    pub lr: LaunchRequest,
    pub port_fds: Vec<OwnedFd>,
}

struct ResolvedUser {
    uid: u32,
    gid: u32,
    home: String,
}

/// Validate a parsed config and assemble the launch descriptor: build the
/// environment, resolve user and groups, pre-open listening sockets, resolve
/// the binary. Runs inside the task loop, so it may block briefly on file
/// stats, user lookups and TCP binds without affecting other tasks.
pub fn plan(task_name: &str, cfg: &TaskConfig) -> Result<Plan, PlanError> {
    let mut env: Vec<String> = Vec::new();

    let runas = match &cfg.user {
        Some(user) => Some(resolve_user(cfg, user)?),
        None => None,
    };
    if cfg.standard_env {
        match (&cfg.user, &runas) {
            (Some(user), Some(u)) => {
                env.push(format!("USER={user}"));
                env.push(format!("HOME={}", u.home));
            }
            _ => {
                env.push(format!("USER={}", std::env::var("USER").unwrap_or_default()));
                env.push(format!("HOME={}", std::env::var("HOME").unwrap_or_default()));
            }
        }
    }
    for (k, v) in &cfg.env {
        env.push(format!("{k}={v}"));
    }
    if cfg.standard_env && !cfg.env.contains_key("PATH") {
        env.push(format!("PATH={DEFAULT_PATH}"));
    }

    let mut port_fds: Vec<OwnedFd> = Vec::new();
    for (name, port) in &cfg.ports {
        let listener = match port {
            Port::Number(n) => TcpListener::bind(("0.0.0.0", *n)),
            Port::Spec(spec) => TcpListener::bind(spec.as_str()),
        }
        .map_err(|source| PlanError::PortBind {
            name: name.clone(),
            source,
        })?;
        let fd = park_fd(listener).map_err(|e| {
            PlanError::Start(anyhow!("extracting fd of port {name:?} listener: {e}"))
        })?;
        logbuf::log(
            "plan",
            Some(task_name),
            format!("opened port {name:?} ({port:?}); parked fd={}", fd.as_raw_fd()),
        );
        env.push(format!(
            "{PORT_FD_ENV_PREFIX}{name}={}",
            FIRST_EXTRA_FD + port_fds.len() as i32
        ));
        port_fds.push(fd);
    }

    let final_bin = resolve_binary(&cfg.binary, cfg.cwd.as_deref())?;
    std::fs::metadata(&final_bin).map_err(|e| {
        PlanError::Config(anyhow!("stat of binary {:?} failed: {e}", cfg.binary))
    })?;

    let base = Path::new(&cfg.binary)
        .file_name()
        .ok_or_else(|| PlanError::Config(anyhow!("binary {:?} has no base name", cfg.binary)))?;
    let mut argv = vec![base.to_string_lossy().into_owned()];
    argv.extend(cfg.args.iter().cloned());

    let mut lr = LaunchRequest {
        path: final_bin,
        env,
        argv,
        dir: cfg.cwd.as_ref().map(PathBuf::from),
        num_files: cfg.num_files,
        ..Default::default()
    };

    if let Some(u) = &runas {
        lr.uid = u.uid;
        lr.gid = u.gid;
    }
    if let Some(group) = &cfg.group {
        lr.gid = lookup_gid(group)?;
    }
    for group in &cfg.groups {
        lr.gids.push(lookup_gid(group)?);
    }

    Ok(Plan { lr, port_fds })
}

fn resolve_user(cfg: &TaskConfig, user: &str) -> Result<ResolvedUser, PlanError> {
    use users::os::unix::UserExt as _;
    if let Some(u) = users::get_user_by_name(user) {
        return Ok(ResolvedUser {
            uid: u.uid(),
            gid: u.primary_group_id(),
            home: u.home_dir().to_string_lossy().into_owned(),
        });
    }
    // No such user: fall back to the explicit error-path values when given.
    let Some(uid) = &cfg.user_lookup_err_uid else {
        return Err(PlanError::Config(anyhow!("unknown user {user:?}")));
    };
    let parse = |what: &str, v: &str| {
        v.parse::<u32>()
            .map_err(|e| PlanError::Config(anyhow!("bad {what} {v:?}: {e}")))
    };
    Ok(ResolvedUser {
        uid: parse("userLookupErrUid", uid)?,
        gid: match &cfg.user_lookup_err_gid {
            Some(g) => parse("userLookupErrGid", g)?,
            None => 0,
        },
        home: cfg.user_lookup_err_home.clone().unwrap_or_default(),
    })
}

fn lookup_gid(group: &str) -> Result<u32, PlanError> {
    users::get_group_by_name(group)
        .map(|g| g.gid())
        .ok_or_else(|| PlanError::Config(anyhow!("unknown group {group:?}")))
}

fn resolve_binary(binary: &str, cwd: Option<&str>) -> Result<PathBuf, PlanError> {
    let bin = Path::new(binary);
    if bin.is_absolute() {
        return Ok(bin.to_path_buf());
    }
    let dir = cwd.unwrap_or(".");
    let dir_abs = std::path::absolute(dir)
        .map_err(|e| PlanError::Config(anyhow!("finding absolute path of dir {dir:?}: {e}")))?;
    Ok(dir_abs.join(bin))
}

/// Move a bound listener's fd out of the dup2 target range and mark it
/// close-on-exec (the helper dup2s it down to its final slot, which clears
/// the flag on the copy the child keeps).
fn park_fd(listener: TcpListener) -> std::io::Result<OwnedFd> {
    let owned: OwnedFd = listener.into();
    let parked = fcntl(owned.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(FD_PARK_MIN))
        .map_err(std::io::Error::from)?;
    Ok(unsafe { OwnedFd::from_raw_fd(parked) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::config::TaskConfig;

    fn cfg(raw: &str) -> TaskConfig {
        TaskConfig::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn happy_plan_builds_argv_and_path_env() {
        let c = cfg(r#"{"binary":"/bin/sleep","args":["60"]}"#);
        let p = plan("t", &c).unwrap();
        assert_eq!(p.lr.argv, vec!["sleep", "60"]);
        assert_eq!(p.lr.path, PathBuf::from("/bin/sleep"));
        assert!(p.lr.env.iter().any(|e| e == &format!("PATH={DEFAULT_PATH}")));
        assert_eq!(p.lr.uid, 0);
        assert!(p.port_fds.is_empty());
    }

    #[test]
    fn explicit_path_wins_over_default() {
        let c = cfg(r#"{"binary":"/bin/true","env":{"PATH":"/opt/bin"}}"#);
        let p = plan("t", &c).unwrap();
        let paths: Vec<_> = p.lr.env.iter().filter(|e| e.starts_with("PATH=")).collect();
        assert_eq!(paths, vec!["PATH=/opt/bin"]);
    }

    #[test]
    fn standard_env_off_means_no_synthesized_entries() {
        let c = cfg(r#"{"binary":"/bin/true","standardEnv":false}"#);
        let p = plan("t", &c).unwrap();
        assert!(!p.lr.env.iter().any(|e| e.starts_with("PATH=")
            || e.starts_with("USER=")
            || e.starts_with("HOME=")));
    }

    #[test]
    fn missing_binary_is_a_config_error() {
        let c = cfg(r#"{"binary":"/no/such/binary/anywhere"}"#);
        match plan("t", &c) {
            Err(PlanError::Config(e)) => assert!(format!("{e:#}").contains("stat of binary")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn relative_binary_resolves_against_cwd() {
        let c = cfg(r#"{"binary":"true","cwd":"/bin"}"#);
        let p = plan("t", &c).unwrap();
        assert_eq!(p.lr.path, PathBuf::from("/bin/true"));
        assert_eq!(p.lr.argv[0], "true");
        assert_eq!(p.lr.dir, Some(PathBuf::from("/bin")));
    }

    #[test]
    fn user_lookup_falls_back_to_explicit_values() {
        let c = cfg(
            r#"{"binary":"/bin/true","user":"nobodyNonExistent",
                "userLookupErrUid":"65534","userLookupErrGid":"65534","userLookupErrHome":"/"}"#,
        );
        let p = plan("t", &c).unwrap();
        assert_eq!(p.lr.uid, 65534);
        assert_eq!(p.lr.gid, 65534);
        assert!(p.lr.env.iter().any(|e| e == "HOME=/"));
        assert!(p.lr.env.iter().any(|e| e == "USER=nobodyNonExistent"));
    }

    #[test]
    fn unknown_user_without_fallback_is_a_config_error() {
        let c = cfg(r#"{"binary":"/bin/true","user":"nobodyNonExistent"}"#);
        assert!(matches!(plan("t", &c), Err(PlanError::Config(_))));
    }

    #[test]
    fn port_fds_are_assigned_densely_from_three() {
        let c = cfg(r#"{"binary":"/bin/true","ports":{"a":0,"b":0}}"#);
        let p = plan("t", &c).unwrap();
        assert_eq!(p.port_fds.len(), 2);
        assert!(p.lr.env.iter().any(|e| e == "RUNSIT_PORTFD_a=3"));
        assert!(p.lr.env.iter().any(|e| e == "RUNSIT_PORTFD_b=4"));
        for fd in &p.port_fds {
            assert!(fd.as_raw_fd() >= FD_PARK_MIN);
        }
    }

    #[test]
    fn bind_conflict_is_a_port_bind_error() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let c = cfg(&format!(
            r#"{{"binary":"/bin/true","ports":{{"main":"127.0.0.1:{port}"}}}}"#
        ));
        match plan("t", &c) {
            Err(PlanError::PortBind { name, .. }) => assert_eq!(name, "main"),
            other => panic!("expected PortBind, got {other:?}"),
        }
    }
}
