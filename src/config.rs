//! Declarative configuration.
//!
//! The config file is YAML: a handful of top-level attributes, well-known
//! blocks (`scheduler`, `log`, `metrics`, `git_clone`, `github_app`), and
//! arbitrary further blocks naming cache backends (`memory`, `disk`, `s3`)
//! and strategies.  Every string supports `${VAR}` expansion, every leaf
//! attribute can be overridden with a `CACHEW_<BLOCK>_<ATTR>` environment
//! variable, and the resolved state directory is exported as `CACHEW_STATE`
//! before a second expansion pass so later values can build on it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::gitclone::GitCloneConfig;
use crate::githubapp::GithubAppConfig;
use crate::metrics::MetricsConfig;
use crate::scheduler::SchedulerConfig;

// ---------------------------------------------------------------------------
// Duration fields
// ---------------------------------------------------------------------------

/// Serde adapter for duration config fields expressed in seconds
/// (fractional values allowed).
pub mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        if seconds < 0.0 || !seconds.is_finite() {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Base state directory, exported as `CACHEW_STATE` for interpolation.
    #[serde(default = "default_state")]
    pub state: String,
    /// Bind address for the proxy server.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Advertised base URL.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default, alias = "git-clone")]
    pub git_clone: Option<GitCloneConfig>,
    #[serde(default, alias = "github-app")]
    pub github_app: GithubAppConfig,
    /// Remaining blocks: cache backends and strategies, resolved by name.
    /// Order is preserved; cache tiers compose in file order.
    #[serde(flatten)]
    pub blocks: serde_yaml::Mapping,
}

fn default_state() -> String {
    "./state".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_url() -> String {
    "http://127.0.0.1:8080/".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            state: default_state(),
            bind: default_bind(),
            url: default_url(),
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
            git_clone: None,
            github_app: GithubAppConfig::default(),
            blocks: serde_yaml::Mapping::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Emit JSON logs instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

/// Names that are cache backend blocks rather than strategies.
pub const CACHE_BLOCKS: &[&str] = &["memory", "disk", "s3"];

/// Well-known block names used to resolve `CACHEW_<BLOCK>_<ATTR>`
/// environment overrides.
const KNOWN_BLOCKS: &[&str] = &[
    "scheduler",
    "log",
    "metrics",
    "git_clone",
    "github_app",
    "memory",
    "disk",
    "s3",
    "git",
    "gomod",
    "hermit",
    "host",
    "github_releases",
    "artifactory",
    "apiv1",
];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub struct Loaded {
    pub config: GlobalConfig,
    /// Variable mapping for `${VAR}` expansion in strategy configs,
    /// including the exported `CACHEW_STATE`.
    pub vars: HashMap<String, String>,
}

/// Snapshot of the process environment.
pub fn parse_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

pub fn load(path: &Path, vars: &HashMap<String, String>) -> Result<Loaded> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_str(&contents, vars).with_context(|| format!("failed to load config: {}", path.display()))
}

pub fn load_str(contents: &str, vars: &HashMap<String, String>) -> Result<Loaded> {
    let mut doc: serde_yaml::Value = if contents.trim().is_empty() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        serde_yaml::from_str(contents).context("failed to parse config file")?
    };

    inject_env_overrides(&mut doc, vars);

    // First pass: resolve the state directory, then export it so later
    // values (mirror roots, cache roots) can interpolate it.
    let state = doc
        .get("state")
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or("./state");
    let state = expand_str(state, vars);

    let mut vars = vars.clone();
    vars.insert("CACHEW_STATE".to_string(), state.clone());

    let doc = expand_yaml_value(doc, &vars);
    let mut config: GlobalConfig =
        serde_yaml::from_value(doc).context("invalid configuration")?;
    config.state = state;

    Ok(Loaded { config, vars })
}

/// Inject `CACHEW_*` environment variables into the document for attributes
/// the file does not set.  `CACHEW_BIND` targets a top-level attribute;
/// `CACHEW_GIT_CLONE_MIRROR_ROOT` targets `git_clone.mirror_root` (block
/// names matched longest-prefix-first, hyphens and underscores equivalent).
fn inject_env_overrides(doc: &mut serde_yaml::Value, vars: &HashMap<String, String>) {
    let serde_yaml::Value::Mapping(root) = doc else {
        return;
    };

    let mut blocks: Vec<&str> = KNOWN_BLOCKS.to_vec();
    // Longest first so git_clone beats git.
    blocks.sort_by_key(|name| std::cmp::Reverse(name.len()));

    for (name, value) in vars {
        let Some(rest) = name.strip_prefix("CACHEW_") else {
            continue;
        };
        let rest = rest.to_lowercase();

        // Top-level attribute?
        if ["state", "bind", "url"].contains(&rest.as_str()) {
            let key = serde_yaml::Value::String(rest);
            root.entry(key).or_insert_with(|| parse_scalar(value));
            continue;
        }

        // Block attribute?
        let Some(block) = blocks
            .iter()
            .find(|block| rest.starts_with(&format!("{block}_")))
        else {
            continue;
        };
        let attr = rest[block.len() + 1..].to_string();
        if attr.is_empty() {
            continue;
        }

        let block_key = serde_yaml::Value::String(block.to_string());
        let entry = root
            .entry(block_key)
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        if let serde_yaml::Value::Mapping(mapping) = entry {
            mapping
                .entry(serde_yaml::Value::String(attr))
                .or_insert_with(|| parse_scalar(value));
        }
    }
}

/// Interpret an environment override as the most specific YAML scalar.
fn parse_scalar(raw: &str) -> serde_yaml::Value {
    if let Ok(value) = raw.parse::<bool>() {
        return serde_yaml::Value::Bool(value);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return serde_yaml::Value::Number(value.into());
    }
    if let Ok(value) = raw.parse::<f64>() {
        return serde_yaml::Value::Number(serde_yaml::Number::from(value));
    }
    serde_yaml::Value::String(raw.to_string())
}

// ---------------------------------------------------------------------------
// ${VAR} expansion
// ---------------------------------------------------------------------------

/// Expand `${VAR}` references against `vars`; unknown variables expand to
/// the empty string, matching shell-style substitution.
pub fn expand_str(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Recursively expand `${VAR}` in every string of a YAML document.
pub fn expand_yaml_value(
    value: serde_yaml::Value,
    vars: &HashMap<String, String>,
) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => serde_yaml::Value::String(expand_str(&s, vars)),
        serde_yaml::Value::Sequence(items) => serde_yaml::Value::Sequence(
            items
                .into_iter()
                .map(|item| expand_yaml_value(item, vars))
                .collect(),
        ),
        serde_yaml::Value::Mapping(mapping) => serde_yaml::Value::Mapping(
            mapping
                .into_iter()
                .map(|(key, value)| (key, expand_yaml_value(value, vars)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Schema text for the global attributes and well-known blocks; cache and
/// strategy schemas are appended by the caller.
pub const GLOBAL_SCHEMA: &str = "\
# Global attributes
state: ./state              # base state directory (exported as CACHEW_STATE)
bind: 127.0.0.1:8080        # proxy listen address
url: http://127.0.0.1:8080/ # advertised base URL

scheduler:
  concurrency: 4            # background job worker pool size

log:
  json: false
  level: info

metrics:
  service_name: cachew
  port: 9102

git_clone:
  mirror_root: ${CACHEW_STATE}/git-mirrors
  fetch_interval: 900       # seconds
  ref_check_interval: 10    # seconds

github_app:
  app_id: \"\"
  private_key_path: \"\"
  installations_json: \"\"

# Cache backends (at least one required)
memory:
  limit_mb: 1024
  max_ttl: 3600             # seconds

disk:
  root: ${CACHEW_STATE}/cache
  limit_mb: 1024
  max_ttl: 3600             # seconds
  evict_interval: 60        # seconds

s3:
  bucket: my-bucket
  prefix: cachew/
  region: us-west-2
";

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let loaded = load_str("", &no_vars()).unwrap();
        assert_eq!(loaded.config.bind, "127.0.0.1:8080");
        assert_eq!(loaded.config.state, "./state");
        assert_eq!(loaded.config.scheduler.concurrency, 4);
        assert!(loaded.config.git_clone.is_none());
        assert!(loaded.config.blocks.is_empty());
        assert_eq!(loaded.vars["CACHEW_STATE"], "./state");
    }

    #[test]
    fn unknown_blocks_are_collected_for_strategies() {
        let loaded = load_str(
            "
bind: 0.0.0.0:9999
memory:
  limit_mb: 64
git:
  bundle_interval: 3600
",
            &no_vars(),
        )
        .unwrap();
        assert_eq!(loaded.config.bind, "0.0.0.0:9999");
        assert!(loaded.config.blocks.contains_key("memory"));
        assert!(loaded.config.blocks.contains_key("git"));
        // Order follows the file.
        let names: Vec<&str> = loaded
            .config
            .blocks
            .keys()
            .filter_map(serde_yaml::Value::as_str)
            .collect();
        assert_eq!(names, vec!["memory", "git"]);
    }

    #[test]
    fn state_is_exported_for_interpolation() {
        let loaded = load_str(
            "
state: /var/lib/cachew
git_clone:
  mirror_root: ${CACHEW_STATE}/mirrors
",
            &no_vars(),
        )
        .unwrap();
        let git_clone = loaded.config.git_clone.unwrap();
        assert_eq!(
            git_clone.mirror_root,
            std::path::PathBuf::from("/var/lib/cachew/mirrors")
        );
    }

    #[test]
    fn env_vars_expand_in_strings() {
        let vars = HashMap::from([("TOKEN_DIR".to_string(), "/secrets".to_string())]);
        let loaded = load_str(
            "
github_app:
  private_key_path: ${TOKEN_DIR}/app.pem
",
            &vars,
        )
        .unwrap();
        assert_eq!(loaded.config.github_app.private_key_path, "/secrets/app.pem");
    }

    #[test]
    fn unknown_vars_expand_to_empty() {
        assert_eq!(expand_str("a${MISSING}b", &no_vars()), "ab");
        assert_eq!(expand_str("${UNTERMINATED", &no_vars()), "${UNTERMINATED");
    }

    #[test]
    fn env_overrides_inject_missing_attributes() {
        let vars = HashMap::from([
            ("CACHEW_BIND".to_string(), "0.0.0.0:8888".to_string()),
            ("CACHEW_SCHEDULER_CONCURRENCY".to_string(), "16".to_string()),
            (
                "CACHEW_GIT_CLONE_MIRROR_ROOT".to_string(),
                "/mirrors".to_string(),
            ),
        ]);
        let loaded = load_str("", &vars).unwrap();
        assert_eq!(loaded.config.bind, "0.0.0.0:8888");
        assert_eq!(loaded.config.scheduler.concurrency, 16);
        assert_eq!(
            loaded.config.git_clone.unwrap().mirror_root,
            std::path::PathBuf::from("/mirrors")
        );
    }

    #[test]
    fn file_attributes_beat_env_overrides() {
        let vars = HashMap::from([("CACHEW_BIND".to_string(), "0.0.0.0:1".to_string())]);
        let loaded = load_str("bind: 127.0.0.1:2222", &vars).unwrap();
        assert_eq!(loaded.config.bind, "127.0.0.1:2222");
    }

    #[test]
    fn duration_fields_parse_from_seconds() {
        let loaded = load_str(
            "
git_clone:
  mirror_root: /mirrors
  fetch_interval: 300
  ref_check_interval: 0.5
",
            &no_vars(),
        )
        .unwrap();
        let git_clone = loaded.config.git_clone.unwrap();
        assert_eq!(git_clone.fetch_interval, std::time::Duration::from_secs(300));
        assert_eq!(
            git_clone.ref_check_interval,
            std::time::Duration::from_millis(500)
        );
    }

    #[test]
    fn scalar_parsing_prefers_specific_types() {
        assert_eq!(parse_scalar("true"), serde_yaml::Value::Bool(true));
        assert_eq!(parse_scalar("42"), serde_yaml::Value::Number(42.into()));
        assert_eq!(
            parse_scalar("hello"),
            serde_yaml::Value::String("hello".to_string())
        );
    }
}
