use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuarrelError, Result};
use crate::routing::{Route, RouteResolver};

/// Top-level Quarrel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root for transcripts, diagnostics, crash records and saved settings.
    #[serde(default = "default_workspace")]
    pub dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace(),
        }
    }
}

fn default_workspace() -> String { "~/.quarrel".to_string() }

/// Reply stabilization policy. These are tunable, not protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Time between two samples of an agent's output.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Give up on an agent after this long.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Consecutive unchanged samples that count as "finished".
    #[serde(default = "default_stable_samples")]
    pub stable_samples: usize,
    /// Recorded as the agent's output when it never stabilizes.
    #[serde(default = "default_timeout_sentinel")]
    pub timeout_sentinel: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
            stable_samples: default_stable_samples(),
            timeout_sentinel: default_timeout_sentinel(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

fn default_interval_ms() -> u64 { 1000 }
fn default_max_wait_secs() -> u64 { 120 }
fn default_stable_samples() -> usize { 6 }
fn default_timeout_sentinel() -> String { "(TIMEOUT)".to_string() }

/// What to do with a WDL line that has an arrow but does not parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Log a warning and drop the line.
    #[default]
    Skip,
    /// Reject the whole workflow.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Appended after the context in every prompt.
    #[serde(default = "default_closing_directive")]
    pub closing_directive: String,
    #[serde(default)]
    pub malformed_lines: MalformedPolicy,
    /// Reject plans whose steps read from agents no earlier step targets.
    /// When false such sources contribute an empty output and a warning.
    #[serde(default)]
    pub strict_sources: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            closing_directive: default_closing_directive(),
            malformed_lines: MalformedPolicy::default(),
            strict_sources: false,
        }
    }
}

fn default_closing_directive() -> String { "REPLY:".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Routing table path. Default: <workspace>/config.json
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_input_operation")]
    pub default_input: String,
    #[serde(default = "default_reply_operation")]
    pub default_reply: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            file: None,
            default_input: default_input_operation(),
            default_reply: default_reply_operation(),
        }
    }
}

fn default_input_operation() -> String { "prompt".to_string() }
fn default_reply_operation() -> String { "reply".to_string() }

/// HTTP agent channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Per-request timeout for submit and sample calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for the initial request that points a slot at its endpoint.
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            prepare_timeout_secs: default_prepare_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 { 30 }
fn default_prepare_timeout() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// Shell commands fired on lifecycle events. This is where narration
/// (e.g. `say "$QUARREL_TEXT"`) or notifications plug in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_run_start: Vec<String>,
    #[serde(default)]
    pub on_reply: Vec<String>,
    #[serde(default)]
    pub on_timeout: Vec<String>,
    #[serde(default)]
    pub on_run_complete: Vec<String>,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            on_run_start: vec![],
            on_reply: vec![],
            on_timeout: vec![],
            on_run_complete: vec![],
            timeout_secs: default_hook_timeout(),
        }
    }
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_run_start.is_empty()
            && self.on_reply.is_empty()
            && self.on_timeout.is_empty()
            && self.on_run_complete.is_empty()
    }
}

fn default_hook_timeout() -> u64 { 30 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| QuarrelError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| QuarrelError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace.dir)
    }

    pub fn transcript_dir(&self) -> PathBuf {
        self.workspace_dir().join("transcripts")
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.workspace_dir().join("debug")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.workspace_dir().join("errors")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.workspace_dir().join("user-settings.json")
    }

    pub fn routing_path(&self) -> PathBuf {
        match self.routing.file {
            Some(ref file) => expand_home(file),
            None => self.workspace_dir().join("config.json"),
        }
    }

    /// Build the hot-reloading route resolver described by `[routing]`.
    pub fn route_resolver(&self) -> RouteResolver {
        RouteResolver::new(
            Some(self.routing_path()),
            Route::new(&self.routing.default_input, &self.routing.default_reply),
        )
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_QUARREL_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_QUARREL_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_QUARREL_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_QUARREL_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_QUARREL_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.poller.interval_ms, 1000);
        assert_eq!(config.poller.max_wait_secs, 120);
        assert_eq!(config.poller.stable_samples, 6);
        assert_eq!(config.poller.timeout_sentinel, "(TIMEOUT)");
        assert_eq!(config.engine.closing_directive, "REPLY:");
        assert_eq!(config.engine.malformed_lines, MalformedPolicy::Skip);
        assert!(!config.engine.strict_sources);
        assert_eq!(config.routing.default_input, "prompt");
        assert_eq!(config.routing.default_reply, "reply");
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert!(config.hooks.is_empty());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let toml_str = r#"
[poller]
interval_ms = 250

[engine]
malformed_lines = "fail"
strict_sources = true
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.poller.interval(), Duration::from_millis(250));
        assert_eq!(config.poller.max_wait(), Duration::from_secs(120));
        assert_eq!(config.engine.malformed_lines, MalformedPolicy::Fail);
        assert!(config.engine.strict_sources);
        assert_eq!(config.engine.closing_directive, "REPLY:");
    }

    #[test]
    fn test_workspace_paths() {
        let toml_str = r#"
[workspace]
dir = "/tmp/quarrel-ws"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transcript_dir(), PathBuf::from("/tmp/quarrel-ws/transcripts"));
        assert_eq!(config.debug_dir(), PathBuf::from("/tmp/quarrel-ws/debug"));
        assert_eq!(config.error_dir(), PathBuf::from("/tmp/quarrel-ws/errors"));
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/tmp/quarrel-ws/user-settings.json")
        );
        assert_eq!(config.routing_path(), PathBuf::from("/tmp/quarrel-ws/config.json"));
    }

    #[test]
    fn test_explicit_routing_file() {
        let toml_str = r#"
[routing]
file = "/etc/quarrel/routes.json"
default_input = "textarea"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.routing_path(), PathBuf::from("/etc/quarrel/routes.json"));
        let resolver = config.route_resolver();
        assert_eq!(resolver.default_route(), &Route::new("textarea", "reply"));
    }
}
