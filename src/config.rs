//! Configuration structures and loading logic

use crate::server::VramStrategy;
use crate::swap::Role;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level supervisor configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub server: ServerConfig,
    pub watchdog: WatchdogConfig,
    pub vision: VisionConfig,
    pub roles: RolesConfig,
    pub swap: SwapConfig,
    pub download: DownloadConfig,

    /// Role loaded at startup (none = start idle)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_role: Option<Role>,

    /// Artifacts fetched into the models directory before the first load
    pub artifacts: Vec<ArtifactConfig>,
}

impl SupervisorConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config: Self = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(port) = std::env::var("LLAMA_SUPERVISOR_PORT") {
            config.server.port = port
                .parse()
                .context("Invalid LLAMA_SUPERVISOR_PORT value")?;
        }
        if let Ok(data_dir) = std::env::var("LLAMA_SUPERVISOR_DATA_DIR") {
            config.server.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(binary) = std::env::var("LLAMA_SUPERVISOR_BINARY") {
            config.server.binary_path = Some(PathBuf::from(binary));
        }
        if let Ok(strategy) = std::env::var("LLAMA_SUPERVISOR_VRAM_STRATEGY") {
            config.server.vram_strategy = strategy
                .parse::<VramStrategy>()
                .map_err(anyhow::Error::msg)
                .context("Invalid LLAMA_SUPERVISOR_VRAM_STRATEGY value")?;
        }
        if let Ok(port) = std::env::var("LLAMA_SUPERVISOR_VISION_PORT") {
            config.vision.port = port
                .parse()
                .context("Invalid LLAMA_SUPERVISOR_VISION_PORT value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            anyhow::bail!("Server port must be >= 1024 (got {})", self.server.port);
        }
        if self.vision.enabled {
            if self.vision.port < 1024 {
                anyhow::bail!("Vision port must be >= 1024 (got {})", self.vision.port);
            }
            if self.vision.port == self.server.port {
                anyhow::bail!(
                    "Vision port {} conflicts with server port",
                    self.vision.port
                );
            }
        }
        if self.server.context_size == 0 {
            anyhow::bail!("Context size cannot be 0");
        }

        let wd = &self.watchdog;
        if wd.check_interval_ms == 0 {
            anyhow::bail!("Watchdog check interval cannot be 0");
        }
        if wd.max_failures == 0 {
            anyhow::bail!("Watchdog max_failures must be >= 1");
        }
        if wd.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "Watchdog backoff multiplier must be >= 1.0 (got {})",
                wd.backoff_multiplier
            );
        }
        if wd.initial_backoff_ms > wd.max_backoff_ms {
            anyhow::bail!(
                "Watchdog initial backoff ({}ms) exceeds max backoff ({}ms)",
                wd.initial_backoff_ms,
                wd.max_backoff_ms
            );
        }

        for artifact in &self.artifacts {
            if artifact.filename.is_empty() {
                anyhow::bail!("Artifact filename cannot be empty ({})", artifact.url);
            }
            if artifact.filename.contains('/') || artifact.filename.contains('\\') {
                anyhow::bail!(
                    "Artifact filename '{}' cannot contain path separators",
                    artifact.filename
                );
            }
        }

        Ok(())
    }
}

/// Primary llama-server settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub data_dir: PathBuf,

    /// Defaults to `<data_dir>/models`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,

    /// Explicit binary, takes precedence over discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,

    /// Multimodal projector passed as `--mmproj`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<PathBuf>,

    /// `-ngl`; 99 offloads every layer
    pub gpu_layers: u32,
    pub context_size: u32,
    pub threads: u32,
    pub vram_strategy: VramStrategy,
    /// MB kept free for the desktop / other processes
    pub vram_reserve_mb: u64,
    pub use_mmap: bool,
    pub use_mlock: bool,

    pub ready_timeout_secs: u64,
    pub health_timeout_ms: u64,
    /// Pause after stop so the driver can reclaim VRAM
    pub stop_settle_ms: u64,
    pub restart_settle_ms: u64,
    pub chat_timeout_secs: u64,

    /// Model families without a native system role
    pub embed_system_prompt_families: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 2026,
            host: "127.0.0.1".to_string(),
            data_dir: default_data_dir(),
            models_dir: None,
            binary_path: None,
            library_path: None,
            mmproj_path: None,
            gpu_layers: 99,
            context_size: 16384,
            threads: 8,
            vram_strategy: VramStrategy::default(),
            vram_reserve_mb: 512,
            use_mmap: true,
            use_mlock: false,
            ready_timeout_secs: 60,
            health_timeout_ms: 2000,
            stop_settle_ms: 500,
            restart_settle_ms: 2000,
            chat_timeout_secs: 300,
            embed_system_prompt_families: vec!["gemma".to_string()],
        }
    }
}

impl ServerConfig {
    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }
}

/// Watchdog tuning
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub max_failures: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// 0 = unlimited
    pub max_restarts: u32,
    pub health_timeout_ms: u64,
    pub ready_timeout_secs: u64,
    pub restart_settle_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 5000,
            max_failures: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            max_restarts: 0,
            health_timeout_ms: 3000,
            ready_timeout_secs: 30,
            restart_settle_ms: 500,
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

/// On-demand vision server settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VisionConfig {
    pub enabled: bool,
    pub port: u16,
    pub host: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<PathBuf>,

    pub gpu_layers: u32,
    pub context_size: u32,

    /// 0 disables idle eviction
    pub idle_timeout_secs: u64,

    /// `--main-gpu`; unset lets llama.cpp choose
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_gpu: Option<u32>,

    pub vram_safety_margin_mb: u64,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub stop_timeout_secs: u64,
    pub analyze_timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 2024,
            host: "127.0.0.1".to_string(),
            model_path: None,
            mmproj_path: None,
            gpu_layers: 99,
            context_size: 8192,
            idle_timeout_secs: 300,
            main_gpu: None,
            vram_safety_margin_mb: 500,
            ready_timeout_secs: 60,
            poll_interval_ms: 500,
            health_timeout_ms: 5000,
            stop_timeout_secs: 5,
            analyze_timeout_secs: 600,
            max_tokens: 2048,
        }
    }
}

impl VisionConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }
}

/// Model files per logical role
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RolesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision_mmproj: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub coder: Option<PathBuf>,

    /// Fill unset roles from the models directory
    pub auto_detect: bool,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            chat: None,
            vision: None,
            vision_mmproj: None,
            coder: None,
            auto_detect: true,
        }
    }
}

/// Swap orchestration timings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SwapConfig {
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Emit a progress event every N polls while loading
    pub progress_every_polls: u32,
    pub stop_settle_ms: u64,
    pub event_capacity: usize,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 60,
            poll_interval_ms: 1000,
            progress_every_polls: 5,
            stop_settle_ms: 1000,
            event_capacity: 64,
        }
    }
}

impl SwapConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }
}

/// Artifact downloader settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub user_agent: String,
    pub max_redirects: u32,
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub response_header_timeout_secs: u64,
    /// Log progress every N percent
    pub log_step_percent: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("llama-supervisor/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            chunk_size: 64 * 1024,
            connect_timeout_secs: 30,
            response_header_timeout_secs: 30,
            log_step_percent: 5,
        }
    }
}

impl DownloadConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout_secs)
    }
}

/// A model file to materialise before startup
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ArtifactConfig {
    pub url: String,
    pub filename: String,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("llama-supervisor")
}
