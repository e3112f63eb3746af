//! Pipeline configuration stored in `<repo>/.patchloop.toml`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::allowlist::AllowList;
use crate::core::types::ModelSet;

/// File name of the per-repository config.
pub const CONFIG_FILE: &str = ".patchloop.toml";
/// Environment variable that overrides `broker.base_url`.
pub const BASE_URL_ENV: &str = "OLLAMA_BASE_URL";

/// Pipeline configuration (TOML).
///
/// Every section defaults, so a partial file is valid. CLI flags override
/// these values for a single run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchloopConfig {
    /// Glob patterns a touched path must match.
    pub allow: Vec<String>,
    /// Constraints forwarded to the planner.
    pub constraints: Vec<String>,
    /// Wall-clock limit for each verification command.
    pub timeout_sec: u64,
    /// Maximum number of files in the repo map.
    pub max_map: usize,
    /// Directory whose files replace the built-in prompts by name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts_dir: Option<PathBuf>,
    pub models: ModelsConfig,
    pub broker: BrokerConfig,
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelsConfig {
    pub planner: String,
    pub coder: String,
    pub critic: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            planner: "llama3.1:8b".to_string(),
            coder: "qwen2.5-coder:7b".to_string(),
            critic: "qwen2.5-coder:7b".to_string(),
        }
    }
}

impl From<ModelsConfig> for ModelSet {
    fn from(models: ModelsConfig) -> Self {
        ModelSet {
            planner: models.planner,
            coder: models.coder,
            critic: models.critic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Base URL of the Ollama-compatible endpoint.
    pub base_url: String,
    /// Per-request timeout. Unset means wait for the endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            request_timeout_secs: None,
        }
    }
}

/// Size limits applied to prompts, events, reports and captured output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    /// Lines of context around a symbol match in a snippet.
    pub context_lines: usize,
    /// Lines of a file excerpted when no symbol matched.
    pub fallback_cap_lines: usize,
    /// Maximum characters carried by a chunk or `cmd_end` output field.
    pub event_chunk_chars: usize,
    /// Characters kept from the end of each failing command stream.
    pub report_tail_chars: usize,
    /// Characters kept from the start of the whole failure report.
    pub report_total_chars: usize,
    /// Bytes of stdout/stderr stored per verification command.
    pub command_output_limit_bytes: usize,
    /// Lines of each touched file shown to the diff debugger.
    pub debug_preview_lines: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            context_lines: 160,
            fallback_cap_lines: 2000,
            event_chunk_chars: 200_000,
            report_tail_chars: 50_000,
            report_total_chars: 200_000,
            command_output_limit_bytes: 8 * 1024 * 1024,
            debug_preview_lines: 400,
        }
    }
}

impl Default for PatchloopConfig {
    fn default() -> Self {
        Self {
            allow: vec!["src/**".to_string(), "tests/**".to_string()],
            constraints: Vec::new(),
            timeout_sec: 900,
            max_map: 1500,
            prompts_dir: None,
            models: ModelsConfig::default(),
            broker: BrokerConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl PatchloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_sec == 0 {
            return Err(anyhow!("timeout_sec must be > 0"));
        }
        if self.max_map == 0 {
            return Err(anyhow!("max_map must be > 0"));
        }
        AllowList::new(&self.allow).context("allow")?;
        for (stage, model) in [
            ("planner", &self.models.planner),
            ("coder", &self.models.coder),
            ("critic", &self.models.critic),
        ] {
            if model.trim().is_empty() {
                return Err(anyhow!("models.{stage} must be non-empty"));
            }
        }
        if self.broker.base_url.trim().is_empty() {
            return Err(anyhow!("broker.base_url must be non-empty"));
        }
        if self.broker.request_timeout_secs == Some(0) {
            return Err(anyhow!("broker.request_timeout_secs must be > 0 when set"));
        }
        self.limits.validate()
    }

    /// Apply the `OLLAMA_BASE_URL` override, if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var(BASE_URL_ENV)
            && !url.trim().is_empty()
        {
            self.broker.base_url = url.trim().to_string();
        }
        self
    }
}

impl Limits {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("context_lines", self.context_lines),
            ("fallback_cap_lines", self.fallback_cap_lines),
            ("event_chunk_chars", self.event_chunk_chars),
            ("report_tail_chars", self.report_tail_chars),
            ("report_total_chars", self.report_total_chars),
            ("command_output_limit_bytes", self.command_output_limit_bytes),
            ("debug_preview_lines", self.debug_preview_lines),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(anyhow!("limits.{name} must be > 0"));
            }
        }
        Ok(())
    }
}

/// Config path for a run: the explicit path if given, else the repo file.
pub fn config_path(repo: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => repo.join(CONFIG_FILE),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PatchloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<PatchloopConfig> {
    if !path.exists() {
        let cfg = PatchloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PatchloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PatchloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PatchloopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        let mut cfg = PatchloopConfig::default();
        cfg.broker.request_timeout_secs = Some(120);
        cfg.prompts_dir = Some(PathBuf::from("prompts"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "allow = [\"app/**\"]\n[models]\ncoder = \"deepseek-coder\"\n[limits]\ncontext_lines = 40\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.allow, vec!["app/**".to_string()]);
        assert_eq!(cfg.models.coder, "deepseek-coder");
        assert_eq!(cfg.models.planner, ModelsConfig::default().planner);
        assert_eq!(cfg.limits.context_lines, 40);
        assert_eq!(cfg.limits.report_tail_chars, 50_000);
        assert_eq!(cfg.timeout_sec, 900);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let mut cfg = PatchloopConfig::default();
        cfg.limits.event_chunk_chars = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("event_chunk_chars"));
    }

    #[test]
    fn empty_allowlist_is_rejected() {
        let cfg = PatchloopConfig {
            allow: Vec::new(),
            ..PatchloopConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("at least one glob"));
    }

    #[test]
    fn blank_model_is_rejected() {
        let mut cfg = PatchloopConfig::default();
        cfg.models.critic = "  ".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("models.critic"));
    }

    #[test]
    fn explicit_config_path_wins() {
        let repo = Path::new("/repo");
        assert_eq!(config_path(repo, None), repo.join(CONFIG_FILE));
        assert_eq!(
            config_path(repo, Some(Path::new("/etc/p.toml"))),
            PathBuf::from("/etc/p.toml")
        );
    }
}
