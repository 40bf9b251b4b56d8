#![forbid(unsafe_code)]

pub mod registry;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSettings,
    pub store: StoreSettings,
    pub agent: AgentSettings,
    pub terminal: TerminalSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub max_lease_age: String,
    // Empty means "whatever the primary checkout's HEAD points at".
    pub mainline: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_lease_age: "2h".to_owned(),
            mainline: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub backup_retention: String,
    pub cleanup_interval: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backup_retention: "7d".to_owned(),
            cleanup_interval: "1h".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub executable: String,
    pub bypass_flag: String,
    pub spawn_timeout: String,
    pub allowed_roots: Vec<String>,
    pub log_retention: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            executable: "claude".to_owned(),
            bypass_flag: "--dangerously-skip-permissions".to_owned(),
            spawn_timeout: "30s".to_owned(),
            allowed_roots: vec!["~".to_owned()],
            log_retention: "30d".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalSettings {
    pub shell: String,
    pub scrollback_lines: usize,
    pub scrollback_bytes: usize,
    pub allowed_origins: Vec<String>,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_owned(),
            scrollback_lines: 100,
            scrollback_bytes: 50_000,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_workers == 0 {
            return Err(AppError::Config(
                "pool.max_workers must be >= 1".to_owned(),
            ));
        }
        if self.terminal.scrollback_lines == 0 || self.terminal.scrollback_bytes == 0 {
            return Err(AppError::Config(
                "terminal scrollback bounds must be >= 1".to_owned(),
            ));
        }
        if self.agent.executable.trim().is_empty() {
            return Err(AppError::Config(
                "agent.executable must not be empty".to_owned(),
            ));
        }
        for (key, value) in [
            ("pool.max_lease_age", &self.pool.max_lease_age),
            ("store.backup_retention", &self.store.backup_retention),
            ("store.cleanup_interval", &self.store.cleanup_interval),
            ("agent.spawn_timeout", &self.agent.spawn_timeout),
            ("agent.log_retention", &self.agent.log_retention),
        ] {
            parse_duration(value)
                .map_err(|e| AppError::Config(format!("invalid {key}: {e}")))?;
        }
        Ok(())
    }

    pub fn max_lease_age(&self) -> Result<Duration> {
        parse_duration(&self.pool.max_lease_age)
    }

    pub fn backup_retention(&self) -> Result<Duration> {
        parse_duration(&self.store.backup_retention)
    }

    pub fn cleanup_interval(&self) -> Result<Duration> {
        parse_duration(&self.store.cleanup_interval)
    }

    pub fn spawn_timeout(&self) -> Result<Duration> {
        parse_duration(&self.agent.spawn_timeout)
    }

    pub fn agent_log_retention(&self) -> Result<Duration> {
        parse_duration(&self.agent.log_retention)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
    pub registry_file: PathBuf,
}

pub fn default_paths() -> Result<ConfigPaths> {
    let dir = config_dir()?;
    Ok(ConfigPaths {
        config_file: dir.join("config.toml"),
        registry_file: dir.join("repos.toml"),
    })
}

fn config_dir() -> Result<PathBuf> {
    let unix = home_dir().map(|h| h.join(".config").join("agentboard"));
    if !cfg!(windows)
        && let Some(dir) = unix
    {
        return Ok(dir);
    }

    let proj = ProjectDirs::from("io", "agentboard", "agentboard").ok_or_else(|| {
        AppError::Config("failed to determine platform config directory".to_owned())
    })?;
    Ok(proj.config_dir().to_path_buf())
}

pub fn load() -> Result<Settings> {
    let paths = default_paths()?;
    load_from_file(&paths.config_file)
}

pub fn load_from_file(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let cfg = Settings::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let raw = std::fs::read_to_string(path).map_err(|e| AppError::io(path, e))?;
    let cfg: Settings = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("failed to parse {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    None
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if input == "~"
        && let Some(home) = home_dir()
    {
        return home.to_string_lossy().to_string();
    }
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| AppError::Internal(format!("failed to get current directory: {e}")))?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .unwrap_or_else(|_| regex::Regex::new("$^").unwrap());
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AppError::Config("empty duration".to_owned()));
    }

    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map_or((s, ""), |i| s.split_at(i));
    let n: u64 = num
        .parse()
        .map_err(|_| AppError::Config(format!("invalid duration: {s}")))?;

    Ok(match unit {
        "ms" => Duration::from_millis(n),
        "s" | "" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 60 * 60),
        "d" => Duration::from_secs(n * 24 * 60 * 60),
        "w" => Duration::from_secs(n * 7 * 24 * 60 * 60),
        _ => {
            return Err(AppError::Config(format!(
                "unsupported duration unit in '{s}' (use ms|s|m|h|d|w)"
            )));
        }
    })
}
