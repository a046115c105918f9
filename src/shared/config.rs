use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::sandbox::runner::SandboxConfig;
use crate::tools::invoker::RetryPolicy;
use crate::tools::redact::{SensitiveKeys, DEFAULT_SENSITIVE_KEYS};
use crate::tools::summary::SummaryOptions;
use crate::tools::truncate::TruncateLimits;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolrunConfig {
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub truncation: TruncateLimits,
    #[serde(default)]
    pub summary: SummarySettings,
    #[serde(default)]
    pub redaction: RedactionSettings,
    #[serde(default)]
    pub endpoint: EndpointSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub helper_root: Option<PathBuf>,
    #[serde(default)]
    pub toolbox_root: Option<PathBuf>,
    #[serde(default)]
    pub bridge_executable: Option<PathBuf>,
    #[serde(default = "default_preview_chars")]
    pub log_preview_chars: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            interpreter: None,
            timeout_secs: default_sandbox_timeout(),
            helper_root: None,
            toolbox_root: None,
            bridge_executable: None,
            log_preview_chars: default_preview_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarySettings {
    #[serde(default = "default_summary_chars")]
    pub max_chars: usize,
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            max_chars: default_summary_chars(),
            sample_limit: default_sample_limit(),
            storage_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedactionSettings {
    #[serde(default = "default_sensitive_keys")]
    pub sensitive_keys: Vec<String>,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            sensitive_keys: default_sensitive_keys(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_endpoint_timeout(),
        }
    }
}

impl ToolrunConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let mut config: ToolrunConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;

        if let Some(url) = config.endpoint.url.take() {
            let url = url.trim().trim_end_matches('/').to_string();
            config.endpoint.url = Some(url).filter(|u| !u.is_empty());
        }
        if config.sandbox.timeout_secs == 0 {
            config.sandbox.timeout_secs = default_sandbox_timeout();
        }

        Ok(config)
    }

    /// Loads the config file if one exists, falling back to defaults, then applies
    /// environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => {
                let path = resolve_config_path();
                if path.exists() {
                    Self::load_from_path(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(python) = env_non_empty("TOOLRUN_PYTHON") {
            self.sandbox.interpreter = Some(PathBuf::from(python));
        }
        if let Some(url) = env_non_empty("TOOLRUN_TOOL_ENDPOINT") {
            self.endpoint.url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(key) = env_non_empty("TOOLRUN_TOOL_API_KEY") {
            self.endpoint.api_key = Some(key);
        }
        if let Some(dir) = env_non_empty("TOOLRUN_SUMMARY_DIR") {
            self.summary.storage_dir = Some(expand_path(dir));
        }
    }

    pub fn sensitive_keys(&self) -> SensitiveKeys {
        SensitiveKeys::new(&self.redaction.sensitive_keys)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    pub fn summary_options(&self, persist: bool) -> SummaryOptions {
        SummaryOptions {
            max_chars: self.summary.max_chars,
            sample_limit: self.summary.sample_limit,
            persist,
            storage_dir: self.summary.storage_dir.clone(),
            sensitive_keys: self.sensitive_keys(),
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            interpreter: self.sandbox.interpreter.clone(),
            timeout: Duration::from_secs(self.sandbox.timeout_secs),
            helper_root: self
                .sandbox
                .helper_root
                .clone()
                .unwrap_or_else(default_helper_root),
            toolbox_root: self.sandbox.toolbox_root.clone(),
            bridge_executable: self.sandbox.bridge_executable.clone(),
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_preview_chars() -> usize {
    500
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_summary_chars() -> usize {
    4000
}

fn default_sample_limit() -> usize {
    3
}

fn default_endpoint_timeout() -> u64 {
    30
}

fn default_sensitive_keys() -> Vec<String> {
    DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect()
}

pub fn default_helper_root() -> PathBuf {
    std::env::temp_dir().join("toolrun-helpers")
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TOOLRUN_CONFIG") {
        return expand_path(path);
    }

    default_config_path()
}

fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolrun")
        .join("toolrun.json")
}

fn home_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}
