//! Primary llama-server supervision
//!
//! [`LlamaServer`] owns at most one llama-server child. Start, stop and every
//! restart path run under a single lifecycle lock, so a watchdog recovery and
//! a model swap can never interleave.

use crate::assets::RuntimeAssets;
use crate::classify::{ArtifactKind, FilenameClassifier, KeywordClassifier, find_projector};
use crate::client::{
    ChatClient, ChatMessage, ChatResponse, MessageAdapter, SamplingParams, SystemPromptEmbedding,
    Tool,
};
use crate::config::ServerConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::estimator::{self, ALL_LAYERS};
use crate::gpu::{GpuProbe, NvidiaSmi, VramInfo};
use crate::health::HealthProbe;
use crate::process::{ProcessHandle, ProcessManager, ServerArgs, SpawnConfig, SystemProcessManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How VRAM is made available before a model load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramStrategy {
    /// Free VRAM only when the incoming model would not fit
    #[default]
    SmartSwap,
    /// Stop and clear every inference process before each load
    AlwaysClear,
    /// Split layers between GPU and CPU instead of clearing
    SmartOffload,
    Manual,
}

impl VramStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VramStrategy::SmartSwap => "smart_swap",
            VramStrategy::AlwaysClear => "always_clear",
            VramStrategy::SmartOffload => "smart_offload",
            VramStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for VramStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VramStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "smart_swap" => Ok(VramStrategy::SmartSwap),
            "always_clear" => Ok(VramStrategy::AlwaysClear),
            "smart_offload" => Ok(VramStrategy::SmartOffload),
            "manual" => Ok(VramStrategy::Manual),
            other => Err(format!("unknown VRAM strategy '{}'", other)),
        }
    }
}

/// Catalogue entry describing a strategy
#[derive(Debug, Clone, Serialize)]
pub struct VramStrategyInfo {
    pub id: VramStrategy,
    pub name: &'static str,
    pub description: &'static str,
    pub recommended: bool,
}

pub fn vram_strategies() -> Vec<VramStrategyInfo> {
    vec![
        VramStrategyInfo {
            id: VramStrategy::SmartSwap,
            name: "Smart Swap",
            description: "Clears VRAM only when not enough is free for the next model.",
            recommended: true,
        },
        VramStrategyInfo {
            id: VramStrategy::AlwaysClear,
            name: "Always Clear",
            description: "Clears VRAM before every load. Safest, with a short downtime.",
            recommended: false,
        },
        VramStrategyInfo {
            id: VramStrategy::SmartOffload,
            name: "Smart Offload",
            description: "Computes how many layers fit on the GPU so large models run on small cards.",
            recommended: false,
        },
        VramStrategyInfo {
            id: VramStrategy::Manual,
            name: "Manual",
            description: "No automatic VRAM management.",
            recommended: false,
        },
    ]
}

/// Stages of [`LlamaServer::swap_model`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStage {
    Stopping,
    CheckingVram,
    Loading,
}

/// Point-in-time server status
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub healthy: bool,
    pub port: u16,
    pub model_name: String,
    pub model_path: Option<PathBuf>,
    pub binary_path: Option<PathBuf>,
    pub binary_found: bool,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub vision_enabled: bool,
    pub vram_strategy: VramStrategy,
    pub started_at: Option<DateTime<Utc>>,
}

/// A `.gguf` file under the models directory
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

struct ServerState {
    config: ServerConfig,
    handle: Option<ProcessHandle>,
    running: bool,
    model_name: String,
    model_path: Option<PathBuf>,
    vision_enabled: bool,
    /// Layers actually passed to the current process
    active_gpu_layers: u32,
    started_at: Option<DateTime<Utc>>,
    /// Cancels the exit watcher and readiness task of the current process
    process_token: Option<CancellationToken>,
}

/// Supervisor for the primary llama-server process
pub struct LlamaServer {
    state: Arc<RwLock<ServerState>>,
    lifecycle: Mutex<()>,
    assets: RwLock<Option<RuntimeAssets>>,
    process_manager: Arc<dyn ProcessManager>,
    gpu: Arc<dyn GpuProbe>,
    probe: HealthProbe,
    adapter: RwLock<Arc<dyn MessageAdapter>>,
    classifier: Arc<dyn FilenameClassifier>,
}

impl LlamaServer {
    /// Server using real processes and nvidia-smi; the runtime is discovered on first start
    pub fn new(config: ServerConfig) -> Self {
        Self::with_components(
            config,
            None,
            Arc::new(SystemProcessManager::new()),
            Arc::new(NvidiaSmi::new()),
        )
    }

    /// Server with injected runtime, process manager and GPU probe
    pub fn with_components(
        config: ServerConfig,
        assets: Option<RuntimeAssets>,
        process_manager: Arc<dyn ProcessManager>,
        gpu: Arc<dyn GpuProbe>,
    ) -> Self {
        let probe = HealthProbe::new(config.health_timeout());
        let adapter: Arc<dyn MessageAdapter> = Arc::new(SystemPromptEmbedding::new(
            config.embed_system_prompt_families.clone(),
        ));
        let gpu_layers = config.gpu_layers;

        Self {
            state: Arc::new(RwLock::new(ServerState {
                config,
                handle: None,
                running: false,
                model_name: String::new(),
                model_path: None,
                vision_enabled: false,
                active_gpu_layers: gpu_layers,
                started_at: None,
                process_token: None,
            })),
            lifecycle: Mutex::new(()),
            assets: RwLock::new(assets),
            process_manager,
            gpu,
            probe,
            adapter: RwLock::new(adapter),
            classifier: Arc::new(KeywordClassifier::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FilenameClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn gpu(&self) -> Arc<dyn GpuProbe> {
        self.gpu.clone()
    }

    pub fn classifier(&self) -> Arc<dyn FilenameClassifier> {
        self.classifier.clone()
    }

    pub async fn assets(&self) -> Option<RuntimeAssets> {
        self.assets.read().await.clone()
    }

    pub async fn set_assets(&self, assets: RuntimeAssets) {
        *self.assets.write().await = Some(assets);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Apply the VRAM strategy and spawn llama-server for `model_path`
    ///
    /// Returns once the process is spawned. Readiness is awaited in the
    /// background; use [`LlamaServer::wait_until_ready`] to block on it.
    pub async fn start(&self, model_path: &Path) -> SupervisorResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(model_path, false).await
    }

    /// Stop the process, including a server someone else started on our port
    pub async fn stop(&self) -> SupervisorResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    /// Stop and start again with the current model
    pub async fn restart(&self) -> SupervisorResult<()> {
        let (model_path, settle) = {
            let state = self.state.read().await;
            (state.model_path.clone(), state.config.restart_settle())
        };
        let model_path = model_path.ok_or(SupervisorError::NoModelLoaded)?;
        self.relaunch(&model_path, settle).await
    }

    /// Stop, wait `settle`, then start `model_path`, atomically
    pub async fn relaunch(&self, model_path: &Path, settle: Duration) -> SupervisorResult<()> {
        let _guard = self.lifecycle.lock().await;
        tracing::info!(model = ?model_path, "Restarting llama-server");
        self.stop_locked().await?;
        tokio::time::sleep(settle).await;
        self.start_locked(model_path, false).await
    }

    /// Replace the running model
    pub async fn switch_model(&self, model_path: &Path) -> SupervisorResult<()> {
        let settle = self.state.read().await.config.restart_settle();
        self.relaunch(model_path, settle).await
    }

    /// Swap sequence used by role changes
    ///
    /// Stops a running process, waits `settle`, checks VRAM for the target,
    /// sets or clears the projector, then starts. A VRAM shortfall is logged
    /// and the load is attempted anyway. `on_stage` is called as each stage
    /// begins.
    pub async fn swap_model(
        &self,
        model_path: &Path,
        mmproj: Option<PathBuf>,
        settle: Duration,
        on_stage: &(dyn Fn(SwapStage) + Send + Sync),
    ) -> SupervisorResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.is_running().await {
            on_stage(SwapStage::Stopping);
            self.stop_locked().await?;
            tokio::time::sleep(settle).await;
        }

        on_stage(SwapStage::CheckingVram);
        let required = estimator::estimate_model_vram(model_path);
        if let Err(e) = self.ensure_vram_locked(required).await {
            tracing::warn!(error = %e, model = ?model_path, "VRAM check failed, loading anyway");
        }

        self.state.write().await.config.mmproj_path = mmproj;
        on_stage(SwapStage::Loading);
        self.start_locked(model_path, true).await
    }

    /// Restart with a new context size, returning the expected restart time
    ///
    /// Unchanged sizes return 0 without restarting. On failure the previous
    /// size is restored.
    pub async fn restart_with_context_size(&self, context_size: u32) -> SupervisorResult<u64> {
        let previous = self.context_size().await;
        if previous == context_size {
            tracing::info!(context_size, "Context size unchanged, no restart needed");
            return Ok(0);
        }

        tracing::info!(from = previous, to = context_size, "Changing context size");
        self.set_context_size(context_size).await;

        if let Err(e) = self.restart().await {
            self.set_context_size(previous).await;
            return Err(e);
        }

        Ok(estimated_restart_secs(context_size))
    }

    /// Poll `/health` until it answers or `timeout` elapses
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let url = self.base_url().await;
        self.probe.wait_ready(&url, READY_POLL_INTERVAL, timeout).await
    }

    async fn start_locked(&self, model_path: &Path, vram_checked: bool) -> SupervisorResult<()> {
        let assets = self.resolve_assets().await?;

        if !model_path.is_file() {
            return Err(SupervisorError::ModelNotFound(model_path.to_path_buf()));
        }

        let (strategy, configured_layers) = {
            let state = self.state.read().await;
            (state.config.vram_strategy, state.config.gpu_layers)
        };
        let required = estimator::estimate_model_vram(model_path);
        let mut gpu_layers = configured_layers;

        match strategy {
            VramStrategy::AlwaysClear => {
                tracing::info!(strategy = %strategy, "Clearing VRAM before load");
                if self.state.read().await.running {
                    self.stop_locked().await?;
                }
                let killed = self.gpu.clear_inference_processes().await;
                crate::metrics::record_vram_clear(killed);
            }
            VramStrategy::SmartSwap => {
                tracing::info!(
                    strategy = %strategy,
                    gpu_layers,
                    required_mb = required,
                    "Applying VRAM strategy"
                );
                if !vram_checked && let Err(e) = self.ensure_vram_locked(required).await {
                    tracing::warn!(error = %e, "VRAM check failed");
                }
            }
            VramStrategy::SmartOffload => {
                gpu_layers = self.offload_layers(model_path, configured_layers).await;
                tracing::info!(strategy = %strategy, gpu_layers, "Applying VRAM strategy");
            }
            VramStrategy::Manual => {
                tracing::info!(strategy = %strategy, "No automatic VRAM management");
            }
        }

        let mut state = self.state.write().await;
        if state.running {
            return Err(SupervisorError::AlreadyRunning(state.model_name.clone()));
        }

        let mmproj = self.resolve_projector(&mut state, model_path);

        let args = ServerArgs {
            model: model_path.to_path_buf(),
            port: state.config.port,
            host: state.config.host.clone(),
            gpu_layers,
            context_size: state.config.context_size,
            threads: state.config.threads,
            mmproj,
            use_mmap: state.config.use_mmap,
            use_mlock: state.config.use_mlock,
            jinja: true,
            flash_attn: false,
            main_gpu: None,
        };
        let spawn_config = SpawnConfig {
            name: "llama-server".to_string(),
            binary: assets.binary.clone(),
            library_dir: assets.library_dir.clone(),
            args,
            env: Vec::new(),
            log_dir: Some(state.config.data_dir.join("logs")),
        };

        let handle = self.process_manager.spawn(spawn_config).await?;

        let model_name = file_name(model_path);
        let token = CancellationToken::new();
        state.handle = Some(handle.clone());
        state.running = true;
        state.model_name = model_name.clone();
        state.model_path = Some(model_path.to_path_buf());
        state.active_gpu_layers = gpu_layers;
        state.started_at = Some(Utc::now());
        state.process_token = Some(token.clone());
        let base_url = state.config.base_url();
        let ready_timeout = state.config.ready_timeout();
        let port = state.config.port;
        drop(state);

        tracing::info!(
            model = %model_name,
            port,
            gpu_layers,
            binary = ?assets.binary,
            "llama-server started"
        );
        crate::metrics::record_server_start(&model_name, gpu_layers);

        self.spawn_exit_watcher(handle, token.clone());
        self.spawn_readiness_check(base_url, ready_timeout, port, token);

        Ok(())
    }

    async fn stop_locked(&self) -> SupervisorResult<()> {
        let (handle, token, base_url, port, settle) = {
            let mut state = self.state.write().await;
            let handle = state.handle.take();
            let token = state.process_token.take();
            let was_running = state.running;
            state.running = false;
            if was_running {
                tracing::info!(model = %state.model_name, "Stopping llama-server");
            }
            (
                handle,
                token,
                state.config.base_url(),
                state.config.port,
                state.config.stop_settle(),
            )
        };

        if let Some(token) = token {
            token.cancel();
        }

        if let Some(handle) = handle {
            self.process_manager
                .stop(handle, GRACEFUL_STOP_TIMEOUT)
                .await?;
            crate::metrics::record_server_stop();
        }

        if self.probe.is_healthy(&base_url).await {
            tracing::warn!(port, "Foreign llama-server still answering on port, killing it");
            if !self.process_manager.kill_port_owner(port).await {
                tracing::warn!(port, "Could not kill process holding port");
            }
        }

        tokio::time::sleep(settle).await;
        Ok(())
    }

    async fn resolve_assets(&self) -> SupervisorResult<RuntimeAssets> {
        if let Some(assets) = self.assets.read().await.clone() {
            return Ok(assets);
        }

        let (binary, library, data_dir) = {
            let state = self.state.read().await;
            (
                state.config.binary_path.clone(),
                state.config.library_path.clone(),
                state.config.data_dir.clone(),
            )
        };
        let assets = RuntimeAssets::discover(binary.as_deref(), library.as_deref(), &data_dir)?;
        *self.assets.write().await = Some(assets.clone());
        Ok(assets)
    }

    /// Configured projector if present, else a sibling of a vision model
    fn resolve_projector(&self, state: &mut ServerState, model_path: &Path) -> Option<PathBuf> {
        state.vision_enabled = false;

        if let Some(mmproj) = state.config.mmproj_path.clone() {
            if mmproj.is_file() {
                tracing::info!(mmproj = ?mmproj, "Vision enabled");
                state.vision_enabled = true;
                return Some(mmproj);
            }
            tracing::warn!(mmproj = ?mmproj, "Projector file not found, vision disabled");
            return None;
        }

        if self.classifier.classify(&file_name(model_path)) != ArtifactKind::Vision {
            return None;
        }

        let models_dir = state.config.models_dir();
        match find_projector(model_path, Some(&models_dir)) {
            Some(found) => {
                tracing::info!(mmproj = ?found, "Vision enabled with discovered projector");
                state.config.mmproj_path = Some(found.clone());
                state.vision_enabled = true;
                Some(found)
            }
            None => {
                tracing::warn!(
                    model = ?model_path,
                    "Vision model without projector, vision disabled"
                );
                None
            }
        }
    }

    async fn offload_layers(&self, model_path: &Path, fallback: u32) -> u32 {
        let reserve = self.state.read().await.config.vram_reserve_mb;
        let Some(info) = self.gpu.vram_info().await else {
            tracing::info!(gpu_layers = fallback, "GPU query unavailable, using configured layers");
            return fallback;
        };

        let available = info.free_mb.saturating_sub(reserve);
        let plan = estimator::plan_gpu_layers(model_path, available);
        if plan.is_partial() {
            tracing::info!(
                available_mb = plan.available_mb,
                required_mb = plan.required_mb,
                gpu_layers = plan.gpu_layers,
                "Partial GPU offload"
            );
        }
        plan.gpu_layers
    }

    fn spawn_exit_watcher(&self, handle: ProcessHandle, token: CancellationToken) {
        let state = self.state.clone();
        let process_manager = self.process_manager.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if process_manager.is_running(&handle).await {
                            continue;
                        }
                        let mut state = state.write().await;
                        if state.handle.as_ref() == Some(&handle) {
                            state.handle = None;
                            state.running = false;
                            state.process_token = None;
                            tracing::warn!(model = %state.model_name, "llama-server exited unexpectedly");
                            crate::metrics::record_server_exit();
                        }
                        return;
                    }
                }
            }
        });
    }

    fn spawn_readiness_check(
        &self,
        base_url: String,
        timeout: Duration,
        port: u16,
        token: CancellationToken,
    ) {
        let probe = self.probe.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                ready = probe.wait_ready(&base_url, READY_POLL_INTERVAL, timeout) => {
                    if ready {
                        tracing::info!(port, "llama-server is ready");
                    } else {
                        tracing::warn!(port, timeout_secs = timeout.as_secs(), "llama-server not healthy in time");
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // VRAM
    // ------------------------------------------------------------------

    /// Make `required_mb` of VRAM free, stopping our own server and clearing
    /// other inference processes if needed
    pub async fn ensure_vram_available(&self, required_mb: u64) -> SupervisorResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_vram_locked(required_mb).await
    }

    async fn ensure_vram_locked(&self, required_mb: u64) -> SupervisorResult<()> {
        let Some(info) = self.gpu.vram_info().await else {
            tracing::info!("VRAM check skipped, GPU query unavailable");
            return Ok(());
        };

        tracing::info!(
            free_mb = info.free_mb,
            total_mb = info.total_mb,
            required_mb,
            "VRAM status"
        );
        if info.free_mb >= required_mb {
            return Ok(());
        }

        tracing::info!(free_mb = info.free_mb, required_mb, "Not enough free VRAM, clearing");
        if self.state.read().await.running {
            self.stop_locked().await?;
        }
        let killed = self.gpu.clear_inference_processes().await;
        crate::metrics::record_vram_clear(killed);

        let free_mb = self
            .gpu
            .vram_info()
            .await
            .map(|i| i.free_mb)
            .unwrap_or(info.free_mb);
        if free_mb < required_mb {
            return Err(SupervisorError::VramInsufficient {
                free_mb,
                required_mb,
            });
        }

        tracing::info!(free_mb, "VRAM freed");
        Ok(())
    }

    pub async fn vram_info(&self) -> Option<VramInfo> {
        self.gpu.vram_info().await
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// True while our child process is alive
    pub async fn is_running(&self) -> bool {
        let handle = {
            let state = self.state.read().await;
            if !state.running {
                return false;
            }
            state.handle.clone()
        };
        match handle {
            Some(handle) => self.process_manager.is_running(&handle).await,
            None => false,
        }
    }

    pub async fn is_healthy(&self) -> bool {
        let url = self.base_url().await;
        self.probe.is_healthy(&url).await
    }

    pub async fn status(&self) -> ServerStatus {
        let healthy = self.is_healthy().await;
        let running = self.is_running().await;
        let binary_path = self.assets.read().await.as_ref().map(|a| a.binary.clone());
        let state = self.state.read().await;

        ServerStatus {
            running: running || healthy,
            healthy,
            port: state.config.port,
            model_name: state.model_name.clone(),
            model_path: state.model_path.clone(),
            binary_found: binary_path.is_some(),
            binary_path,
            context_size: state.config.context_size,
            gpu_layers: if running {
                state.active_gpu_layers
            } else {
                state.config.gpu_layers
            },
            vision_enabled: state.vision_enabled,
            vram_strategy: state.config.vram_strategy,
            started_at: state.started_at,
        }
    }

    pub async fn base_url(&self) -> String {
        self.state.read().await.config.base_url()
    }

    pub async fn model_path(&self) -> Option<PathBuf> {
        self.state.read().await.model_path.clone()
    }

    pub async fn model_name(&self) -> String {
        self.state.read().await.model_name.clone()
    }

    pub async fn is_vision_enabled(&self) -> bool {
        self.state.read().await.vision_enabled
    }

    /// Every `.gguf` below the models directory
    pub async fn available_models(&self) -> SupervisorResult<Vec<ModelInfo>> {
        let dir = self.state.read().await.config.models_dir();
        tokio::task::spawn_blocking(move || list_models(&dir))
            .await
            .map_err(|e| SupervisorError::Io(std::io::Error::other(e)))?
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn vram_strategy(&self) -> VramStrategy {
        self.state.read().await.config.vram_strategy
    }

    pub async fn set_vram_strategy(&self, strategy: VramStrategy) {
        self.state.write().await.config.vram_strategy = strategy;
        tracing::info!(strategy = %strategy, "VRAM strategy changed");
    }

    pub async fn vram_reserve_mb(&self) -> u64 {
        self.state.read().await.config.vram_reserve_mb
    }

    pub async fn set_vram_reserve_mb(&self, reserve_mb: u64) {
        self.state.write().await.config.vram_reserve_mb = reserve_mb;
        tracing::info!(reserve_mb, "VRAM reserve changed");
    }

    pub async fn use_mmap(&self) -> bool {
        self.state.read().await.config.use_mmap
    }

    pub async fn set_use_mmap(&self, enabled: bool) {
        self.state.write().await.config.use_mmap = enabled;
    }

    pub async fn use_mlock(&self) -> bool {
        self.state.read().await.config.use_mlock
    }

    pub async fn set_use_mlock(&self, enabled: bool) {
        self.state.write().await.config.use_mlock = enabled;
    }

    pub async fn port(&self) -> u16 {
        self.state.read().await.config.port
    }

    /// Takes effect on the next start
    pub async fn set_port(&self, port: u16) {
        self.state.write().await.config.port = port;
        tracing::info!(port, "llama-server port changed");
    }

    pub async fn context_size(&self) -> u32 {
        self.state.read().await.config.context_size
    }

    pub async fn set_context_size(&self, context_size: u32) {
        self.state.write().await.config.context_size = context_size;
    }

    pub async fn gpu_layers(&self) -> u32 {
        self.state.read().await.config.gpu_layers
    }

    pub async fn set_gpu_layers(&self, layers: u32) {
        self.state.write().await.config.gpu_layers = layers.min(ALL_LAYERS);
    }

    pub async fn mmproj_path(&self) -> Option<PathBuf> {
        self.state.read().await.config.mmproj_path.clone()
    }

    pub async fn set_mmproj_path(&self, path: Option<PathBuf>) {
        tracing::info!(mmproj = ?path, "Projector path changed");
        self.state.write().await.config.mmproj_path = path;
    }

    pub async fn set_message_adapter(&self, adapter: Arc<dyn MessageAdapter>) {
        *self.adapter.write().await = adapter;
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Client for the current process; fails unless the server answers `/health`
    pub async fn chat_client(&self) -> SupervisorResult<ChatClient> {
        if !self.is_healthy().await {
            return Err(SupervisorError::NotRunning);
        }

        let state = self.state.read().await;
        Ok(
            ChatClient::new(state.config.base_url(), state.config.chat_timeout())
                .with_model_name(state.model_name.clone())
                .with_adapter(self.adapter.read().await.clone()),
        )
    }

    pub async fn stream_chat<F>(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
        on_chunk: F,
    ) -> SupervisorResult<()>
    where
        F: FnMut(&str, bool) + Send,
    {
        self.chat_client()
            .await?
            .stream_chat(messages, params, on_chunk)
            .await
    }

    pub async fn stream_chat_with_tools<F>(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[Tool],
        on_chunk: F,
    ) -> SupervisorResult<ChatResponse>
    where
        F: FnMut(&str, bool) + Send,
    {
        self.chat_client()
            .await?
            .stream_chat_with_tools(messages, tools, on_chunk)
            .await
    }

    pub async fn quick_chat(&self, system_prompt: &str, user_message: &str) -> SupervisorResult<String> {
        self.chat_client()
            .await?
            .quick_chat(system_prompt, user_message)
            .await
    }

    pub async fn quick_chat_with_timeout(
        &self,
        system_prompt: &str,
        user_message: &str,
        timeout: Duration,
    ) -> SupervisorResult<String> {
        self.chat_client()
            .await?
            .quick_chat_with_timeout(system_prompt, user_message, timeout)
            .await
    }
}

/// Expected restart time for a context size
pub fn estimated_restart_secs(context_size: u32) -> u64 {
    match context_size {
        n if n > 65_536 => 12,
        n if n > 32_768 => 8,
        _ => 5,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn list_models(dir: &Path) -> SupervisorResult<Vec<ModelInfo>> {
    let mut models = Vec::new();
    if !dir.is_dir() {
        return Ok(models);
    }

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let is_gguf = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false);
            if !is_gguf {
                continue;
            }
            models.push(ModelInfo {
                name: file_name(&path),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
    }

    models.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(models)
}
