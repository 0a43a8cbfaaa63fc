/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Configuration management with validation and defaults.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PacsmithError, PacsmithResult};
use crate::executor::FailurePolicy;
use crate::resolver::ProviderPolicy;

/// Main configuration structure for pacsmith
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bounded wait for each source during a search, in seconds
    pub search_timeout_secs: u64,

    /// Shorter queries return no results
    pub min_query_len: usize,

    /// Enable colored output
    pub color: bool,

    /// Community source (AUR) configuration
    pub aur: AurConfig,

    /// Dependency resolver configuration
    pub resolver: ResolverConfig,

    /// Transaction executor configuration
    pub transaction: TransactionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search_timeout_secs: 5,
            min_query_len: 2,
            color: true,
            aur: AurConfig::default(),
            resolver: ResolverConfig::default(),
            transaction: TransactionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// AUR-specific configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AurConfig {
    /// Query the community source at all
    pub enabled: bool,

    /// AUR RPC base URL
    pub rpc_url: String,

    /// Base URL for build-file snapshots
    pub snapshot_url: String,

    /// Cached RPC answers expire after this many seconds (0 = no caching)
    pub cache_ttl_secs: u64,

    /// Maximum number of cached entries
    pub cache_size: usize,

    /// RPC request rate limit
    pub requests_per_second: u32,

    /// Build directory path
    pub build_dir: PathBuf,

    /// Number of parallel make jobs (0 = auto-detect)
    pub make_jobs: usize,

    /// Disable compression for faster local builds
    pub disable_compression: bool,

    /// Use ccache for faster rebuilds
    pub use_ccache: bool,

    /// Extra makepkg flags used for the build step
    pub makepkg_flags: Vec<String>,
}

/// Per-user build root, so other local users cannot swap reviewed scripts
fn default_build_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("pacsmith-{}", unsafe { libc::geteuid() })))
        .join("pacsmith")
        .join("aur")
}

impl Default for AurConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_url: "https://aur.archlinux.org/rpc/".to_string(),
            snapshot_url: "https://aur.archlinux.org/cgit/aur.git/snapshot/".to_string(),
            cache_ttl_secs: 300,
            cache_size: 500,
            requests_per_second: 10,
            build_dir: default_build_dir(),
            make_jobs: 0, // Auto-detect
            disable_compression: true,
            use_ccache: false,
            makepkg_flags: vec!["--syncdeps".to_string(), "--noconfirm".to_string()],
        }
    }
}

/// Dependency resolver configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Which source wins when only virtual providers exist
    pub provider_policy: ProviderPolicy,

    /// Treat checkdepends as build-time dependencies
    pub include_check_depends: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            provider_policy: ProviderPolicy::PreferBinaryRepo,
            include_check_depends: false,
        }
    }
}

/// Transaction executor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// What happens to the rest of the plan after a failure
    pub failure_policy: FailurePolicy,

    /// Our own advisory lock, held while installing
    pub lock_file: PathBuf,

    /// The package database lock owned by pacman
    pub pacman_db_lock: PathBuf,

    /// Maximum wait for either lock, in seconds
    pub lock_wait_secs: u64,

    /// Command prefix for privileged steps
    pub escalation: Vec<String>,

    /// Output lines kept per subprocess for failure reports
    pub captured_lines: usize,

    /// Grace period between SIGTERM and SIGKILL on cancel
    pub terminate_grace_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::SkipDependents,
            lock_file: PathBuf::from("/run/lock/pacsmith.lock"),
            pacman_db_lock: PathBuf::from("/var/lib/pacman/db.lck"),
            lock_wait_secs: 60,
            escalation: vec!["sudo".to_string()],
            captured_lines: 200,
            terminate_grace_secs: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,

    /// Append-only transaction history (JSON lines)
    pub history_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            history_file: dirs::state_dir().map(|d| d.join("pacsmith").join("history.jsonl")),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/pacsmith/pacsmith.toml (system-wide)
    /// 2. ~/.config/pacsmith/config.toml (user)
    /// 3. Environment variables (PACSMITH_*)
    pub fn load() -> Self {
        let mut config = Config::default();

        if let Some(parsed) = Self::read_file(Path::new("/etc/pacsmith/pacsmith.toml")) {
            config = parsed;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pacsmith").join("config.toml");
            if let Some(parsed) = Self::read_file(&user_config) {
                config = config.merge(parsed);
            }
        }

        config.apply_env_overrides()
    }

    /// Parse one config file, logging (not failing on) malformed content
    fn read_file(path: &Path) -> Option<Config> {
        if !path.exists() {
            return None;
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), "cannot read config: {}", e);
                return None;
            }
        };
        match toml::from_str::<Config>(&content) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring malformed config: {}", e);
                None
            }
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> PacsmithResult<Self> {
        toml::from_str(content).map_err(|e| PacsmithError::Config {
            message: e.to_string(),
        })
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        let default = Config::default();

        if other.search_timeout_secs != default.search_timeout_secs {
            self.search_timeout_secs = other.search_timeout_secs;
        }
        if other.min_query_len != default.min_query_len {
            self.min_query_len = other.min_query_len;
        }
        if other.color != default.color {
            self.color = other.color;
        }
        if other.resolver.provider_policy != default.resolver.provider_policy {
            self.resolver.provider_policy = other.resolver.provider_policy;
        }
        if other.resolver.include_check_depends != default.resolver.include_check_depends {
            self.resolver.include_check_depends = other.resolver.include_check_depends;
        }
        if other.transaction.failure_policy != default.transaction.failure_policy {
            self.transaction.failure_policy = other.transaction.failure_policy;
        }
        if other.transaction.escalation != default.transaction.escalation {
            self.transaction.escalation = other.transaction.escalation;
        }
        if other.transaction.lock_wait_secs != default.transaction.lock_wait_secs {
            self.transaction.lock_wait_secs = other.transaction.lock_wait_secs;
        }
        if other.logging.level != default.logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }
        if other.logging.history_file != default.logging.history_file {
            self.logging.history_file = other.logging.history_file;
        }

        self.aur = self.aur.merge(other.aur);

        self
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("PACSMITH_SEARCH_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.search_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("PACSMITH_AUR") {
            self.aur.enabled = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("PACSMITH_FAILURE_POLICY") {
            match val.to_lowercase().as_str() {
                "abort" | "abort-remaining" => self.transaction.failure_policy = FailurePolicy::AbortRemaining,
                "skip" | "skip-dependents" => self.transaction.failure_policy = FailurePolicy::SkipDependents,
                other => tracing::warn!("unknown PACSMITH_FAILURE_POLICY '{}'", other),
            }
        }

        if let Ok(val) = std::env::var("PACSMITH_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.search_timeout_secs == 0 {
            return Err("search_timeout_secs must be at least 1".to_string());
        }
        if self.aur.cache_size == 0 && self.aur.cache_ttl_secs > 0 {
            return Err("aur.cache_size must be at least 1 when caching is enabled".to_string());
        }
        if self.aur.requests_per_second == 0 {
            return Err("aur.requests_per_second must be at least 1".to_string());
        }
        if let Err(e) = url::Url::parse(&self.aur.rpc_url) {
            return Err(format!("aur.rpc_url is not a valid URL: {}", e));
        }
        if let Err(e) = url::Url::parse(&self.aur.snapshot_url) {
            return Err(format!("aur.snapshot_url is not a valid URL: {}", e));
        }
        if self.transaction.escalation.iter().all(|s| s.trim().is_empty()) {
            return Err("transaction.escalation must name a command (e.g. [\"sudo\"])".to_string());
        }
        if self.transaction.captured_lines == 0 {
            return Err("transaction.captured_lines must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    /// Get the number of make jobs, auto-detecting if set to 0
    pub fn get_make_jobs(&self) -> usize {
        if self.aur.make_jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.aur.make_jobs
        }
    }
}

impl AurConfig {
    fn merge(mut self, other: AurConfig) -> Self {
        let default = AurConfig::default();

        if other.enabled != default.enabled {
            self.enabled = other.enabled;
        }
        if other.rpc_url != default.rpc_url {
            self.rpc_url = other.rpc_url;
        }
        if other.snapshot_url != default.snapshot_url {
            self.snapshot_url = other.snapshot_url;
        }
        if other.cache_ttl_secs != default.cache_ttl_secs {
            self.cache_ttl_secs = other.cache_ttl_secs;
        }
        if other.cache_size != default.cache_size {
            self.cache_size = other.cache_size;
        }
        if other.build_dir != default.build_dir {
            self.build_dir = other.build_dir;
        }
        if other.make_jobs != default.make_jobs {
            self.make_jobs = other.make_jobs;
        }
        if other.disable_compression != default.disable_compression {
            self.disable_compression = other.disable_compression;
        }
        if other.use_ccache != default.use_ccache {
            self.use_ccache = other.use_ccache;
        }
        if other.makepkg_flags != default.makepkg_flags {
            self.makepkg_flags = other.makepkg_flags;
        }

        self
    }
}
