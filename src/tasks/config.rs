use anyhow::Context as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A parsed per-task config file (one JSON object per `<taskname>.json`).
/// Unknown keys are a configuration error; the task enters the error state
/// rather than silently ignoring a typo.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TaskConfig {
    /// Target executable; resolved against `cwd` when relative.
    pub binary: String,

    #[serde(default)]
    pub cwd: Option<String>,

    /// Appended after argv[0].
    #[serde(default)]
    pub args: Vec<String>,

    /// Child environment entries, overlaid on the standard ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Synthesize USER/HOME and a default PATH (unless `env` sets one).
    #[serde(default = "default_standard_env")]
    pub standard_env: bool,

    /// Run as this user (uid/gid/home from the system user database).
    #[serde(default)]
    pub user: Option<String>,

    // Fallbacks for platforms without a working user database: used only when
    // the `user` lookup fails.
    #[serde(default)]
    pub user_lookup_err_uid: Option<String>,
    #[serde(default)]
    pub user_lookup_err_gid: Option<String>,
    #[serde(default)]
    pub user_lookup_err_home: Option<String>,

    /// Primary group, overriding the user's.
    #[serde(default)]
    pub group: Option<String>,

    /// Supplemental groups.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Listening TCP sockets to pre-open and hand to the child as inherited
    /// fds, densely numbered from 3 in map order.
    #[serde(default)]
    pub ports: BTreeMap<String, Port>,

    /// Child nofile rlimit; 0 leaves it unchanged.
    #[serde(default)]
    pub num_files: u64,
}

fn default_standard_env() -> bool {
    true
}

/// A port value is either a bare port number (listen on all interfaces) or a
/// full bind spec like "127.0.0.1:8080".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Spec(String),
}

impl TaskConfig {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(raw).context("bad task config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let c = TaskConfig::parse(br#"{"binary":"/bin/sleep","args":["60"]}"#).unwrap();
        assert_eq!(c.binary, "/bin/sleep");
        assert_eq!(c.args, vec!["60"]);
        assert!(c.standard_env);
        assert_eq!(c.num_files, 0);
        assert!(c.ports.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TaskConfig::parse(br#"{"binary":"/bin/true","bogusKey":1}"#).unwrap_err();
        assert!(format!("{err:#}").contains("bogusKey"));
    }

    #[test]
    fn missing_binary_is_rejected() {
        assert!(TaskConfig::parse(br#"{"args":["x"]}"#).is_err());
    }

    #[test]
    fn port_values_take_both_forms() {
        let c = TaskConfig::parse(
            br#"{"binary":"/bin/true","ports":{"main":12345,"alt":"127.0.0.1:9000"}}"#,
        )
        .unwrap();
        assert_eq!(c.ports["main"], Port::Number(12345));
        assert_eq!(c.ports["alt"], Port::Spec("127.0.0.1:9000".to_string()));
        // BTreeMap gives deterministic iteration order for fd assignment.
        let names: Vec<_> = c.ports.keys().cloned().collect();
        assert_eq!(names, vec!["alt", "main"]);
    }

    #[test]
    fn user_fallback_keys_parse() {
        let c = TaskConfig::parse(
            br#"{"binary":"/bin/true","user":"nobodyNonExistent",
                 "userLookupErrUid":"65534","userLookupErrGid":"65534","userLookupErrHome":"/"}"#,
        )
        .unwrap();
        assert_eq!(c.user.as_deref(), Some("nobodyNonExistent"));
        assert_eq!(c.user_lookup_err_uid.as_deref(), Some("65534"));
        assert_eq!(c.user_lookup_err_home.as_deref(), Some("/"));
    }

    #[test]
    fn standard_env_can_be_disabled() {
        let c = TaskConfig::parse(br#"{"binary":"/bin/true","standardEnv":false}"#).unwrap();
        assert!(!c.standard_env);
    }
}
