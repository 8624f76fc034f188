//! Role-based model swapping
//!
//! The GPU holds one model at a time. [`ModelSwapManager`] maps logical roles
//! to model files and moves the primary server between them, reporting
//! progress on a broadcast channel.

use crate::classify::ArtifactKind;
use crate::config::{RolesConfig, SwapConfig};
use crate::error::{SupervisorError, SupervisorResult};
use crate::server::{LlamaServer, SwapStage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast};

const GIB: u64 = 1024 * 1024 * 1024;

/// Logical model slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Chat,
    Vision,
    Coder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Chat => "chat",
            Role::Vision => "vision",
            Role::Coder => "coder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Ok(Role::Chat),
            "vision" => Ok(Role::Vision),
            "coder" => Ok(Role::Coder),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Swap lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwapEvent {
    Started {
        from: Role,
        to: Role,
        estimated_secs: u64,
    },
    Progress {
        role: Role,
        percent: u8,
        message: String,
    },
    Completed {
        role: Role,
        success: bool,
        elapsed: Duration,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SwapStatus {
    pub swapping: bool,
    pub current_role: Role,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisionModelInfo {
    pub model: Option<PathBuf>,
    pub mmproj: Option<PathBuf>,
    /// Both model and projector are known
    pub configured: bool,
}

struct SwapState {
    chat: Option<PathBuf>,
    vision: Option<PathBuf>,
    vision_mmproj: Option<PathBuf>,
    coder: Option<PathBuf>,
    current: Role,
    swapping: bool,
    swap_started: Option<Instant>,
}

impl SwapState {
    fn path_for(&self, role: Role) -> Option<PathBuf> {
        match role {
            Role::Chat => self.chat.clone(),
            Role::Vision => self.vision.clone(),
            Role::Coder => self.coder.clone(),
        }
    }
}

/// Moves the primary server between role models
pub struct ModelSwapManager {
    server: Arc<LlamaServer>,
    config: SwapConfig,
    state: RwLock<SwapState>,
    /// Held for the whole of `ensure_role_loaded`
    swap_lock: Mutex<()>,
    events: broadcast::Sender<SwapEvent>,
}

impl ModelSwapManager {
    pub fn new(server: Arc<LlamaServer>, roles: RolesConfig, config: SwapConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            server,
            state: RwLock::new(SwapState {
                chat: roles.chat,
                vision: roles.vision,
                vision_mmproj: roles.vision_mmproj,
                coder: roles.coder,
                current: Role::Chat,
                swapping: false,
                swap_started: None,
            }),
            swap_lock: Mutex::new(()),
            config,
            events,
        }
    }

    pub async fn register_chat(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::info!(role = %Role::Chat, model = ?path, "Model registered");
        self.state.write().await.chat = Some(path);
    }

    pub async fn register_vision(&self, model: impl Into<PathBuf>, mmproj: Option<PathBuf>) {
        let model = model.into();
        tracing::info!(role = %Role::Vision, model = ?model, mmproj = ?mmproj, "Model registered");
        let mut state = self.state.write().await;
        state.vision = Some(model);
        state.vision_mmproj = mmproj;
    }

    pub async fn register_coder(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::info!(role = %Role::Coder, model = ?path, "Model registered");
        self.state.write().await.coder = Some(path);
    }

    /// Fill unset roles from `.gguf` files in `models_dir` and its
    /// `library/`, `vision/` and `custom/` subdirectories
    pub async fn auto_detect(&self, models_dir: &Path) {
        let dirs = [
            models_dir.to_path_buf(),
            models_dir.join("library"),
            models_dir.join("vision"),
            models_dir.join("custom"),
        ];
        let files = tokio::task::spawn_blocking(move || {
            dirs.iter().flat_map(|dir| gguf_files(dir)).collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        tracing::info!(dir = ?models_dir, count = files.len(), "Scanning for role models");

        let classifier = self.server.classifier();
        let classified: Vec<(PathBuf, ArtifactKind)> = files
            .into_iter()
            .map(|path| {
                let kind = classifier.classify(&file_name(&path));
                (path, kind)
            })
            .collect();

        let mut state = self.state.write().await;
        for (path, kind) in &classified {
            let slot = match kind {
                ArtifactKind::Projector => &mut state.vision_mmproj,
                ArtifactKind::Vision => &mut state.vision,
                ArtifactKind::Coder => &mut state.coder,
                ArtifactKind::Chat => &mut state.chat,
                ArtifactKind::Other => continue,
            };
            if slot.is_none() {
                tracing::info!(kind = ?kind, model = ?path, "Detected model");
                *slot = Some(path.clone());
            }
        }

        if state.chat.is_none() {
            let fallback = classified
                .iter()
                .find(|(_, kind)| !matches!(kind, ArtifactKind::Projector | ArtifactKind::Vision));
            if let Some((path, _)) = fallback {
                tracing::info!(model = ?path, "Using fallback chat model");
                state.chat = Some(path.clone());
            }
        }

        match (&state.vision, &state.vision_mmproj) {
            (Some(model), Some(mmproj)) => {
                tracing::info!(model = ?model, mmproj = ?mmproj, "Vision model complete")
            }
            (Some(model), None) => {
                tracing::warn!(model = ?model, "Vision model without projector, images will fail")
            }
            _ => {}
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.events.subscribe()
    }

    pub async fn current_role(&self) -> Role {
        self.state.read().await.current
    }

    pub async fn status(&self) -> SwapStatus {
        let state = self.state.read().await;
        let elapsed_secs = match (state.swapping, state.swap_started) {
            (true, Some(started)) => started.elapsed().as_secs_f64(),
            _ => 0.0,
        };
        SwapStatus {
            swapping: state.swapping,
            current_role: state.current,
            elapsed_secs,
        }
    }

    pub async fn configured_models(&self) -> BTreeMap<Role, Option<PathBuf>> {
        let state = self.state.read().await;
        [Role::Chat, Role::Vision, Role::Coder]
            .into_iter()
            .map(|role| (role, state.path_for(role)))
            .collect()
    }

    pub async fn has_vision_model(&self) -> bool {
        self.vision_model_info().await.configured
    }

    pub async fn vision_model_info(&self) -> VisionModelInfo {
        let state = self.state.read().await;
        VisionModelInfo {
            model: state.vision.clone(),
            mmproj: state.vision_mmproj.clone(),
            configured: state.vision.is_some() && state.vision_mmproj.is_some(),
        }
    }

    /// Make `role` the active model, swapping if necessary
    ///
    /// Returns how long the swap took, zero when nothing had to change.
    /// A call made while another swap is running fails with
    /// [`SupervisorError::SwapInProgress`].
    ///
    /// The watchdog is not paused: the readiness wait runs outside the
    /// server's lifecycle lock, so a watchdog configured with a shorter
    /// failure window than `ready_timeout` can relaunch a model mid-load.
    pub async fn ensure_role_loaded(&self, role: Role) -> SupervisorResult<Duration> {
        let Ok(_swap_guard) = self.swap_lock.try_lock() else {
            return Err(SupervisorError::SwapInProgress);
        };

        let (target, mmproj, from) = {
            let state = self.state.read().await;
            let target = state
                .path_for(role)
                .ok_or(SupervisorError::RoleNotConfigured(role))?;
            let mmproj = match role {
                Role::Vision => state.vision_mmproj.clone(),
                _ => None,
            };
            (target, mmproj, state.current)
        };

        if !target.is_file() {
            return Err(SupervisorError::ModelNotFound(target));
        }

        if from == role && self.is_loaded(&target).await {
            tracing::debug!(role = %role, "Role already active");
            return Ok(Duration::ZERO);
        }

        let started = {
            let mut state = self.state.write().await;
            let now = Instant::now();
            state.swapping = true;
            state.swap_started = Some(now);
            now
        };

        let result = self.perform_swap(from, role, &target, mmproj).await;
        let elapsed = started.elapsed();

        {
            let mut state = self.state.write().await;
            state.swapping = false;
            state.swap_started = None;
            if result.is_ok() {
                state.current = role;
            }
        }

        match &result {
            Ok(()) => {
                self.emit_progress(role, 100, "Model ready".to_string());
                tracing::info!(
                    role = %role,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Model swap complete"
                );
            }
            Err(e) => {
                tracing::error!(role = %role, error = %e, "Model swap failed");
            }
        }
        self.emit(SwapEvent::Completed {
            role,
            success: result.is_ok(),
            elapsed,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        crate::metrics::record_swap(role.as_str(), result.is_ok(), elapsed.as_secs_f64());

        result.map(|()| elapsed)
    }

    /// Run `f` with the vision model loaded, then restore the previous role
    ///
    /// A failed restore is logged; the result of `f` is returned either way.
    pub async fn with_vision_model<F, Fut, T>(&self, f: F) -> SupervisorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SupervisorResult<T>>,
    {
        let previous = self.current_role().await;
        self.ensure_role_loaded(Role::Vision).await?;

        let result = f().await;

        if previous != Role::Vision
            && let Err(e) = self.ensure_role_loaded(previous).await
        {
            tracing::warn!(role = %previous, error = %e, "Failed to restore previous model");
        }

        result
    }

    async fn perform_swap(
        &self,
        from: Role,
        to: Role,
        target: &Path,
        mmproj: Option<PathBuf>,
    ) -> SupervisorResult<()> {
        let estimated_secs = std::fs::metadata(target)
            .map(|m| estimate_swap_secs(m.len()))
            .unwrap_or(15);

        tracing::info!(from = %from, to = %to, estimated_secs, "Model swap starting");
        self.emit(SwapEvent::Started {
            from,
            to,
            estimated_secs,
        });
        self.emit_progress(to, 10, "Preparing model swap".to_string());

        let name = file_name(target);
        let on_stage = |stage: SwapStage| match stage {
            SwapStage::Stopping => self.emit_progress(to, 20, "Stopping current model".to_string()),
            SwapStage::CheckingVram => self.emit_progress(to, 40, "Checking VRAM".to_string()),
            SwapStage::Loading => self.emit_progress(to, 60, format!("Loading {}", name)),
        };
        self.server
            .swap_model(target, mmproj, self.config.stop_settle(), &on_stage)
            .await?;

        self.emit_progress(to, 80, "Waiting for server".to_string());

        let timeout = self.config.ready_timeout();
        let interval = self.config.poll_interval();
        let every = self.config.progress_every_polls.max(1);
        let ready = crate::health::wait_until_with(
            || self.server.is_healthy(),
            interval,
            timeout,
            |attempt| {
                if attempt % every == 0 {
                    let waited = interval * attempt;
                    let share = (waited.as_secs_f64() / timeout.as_secs_f64().max(1e-3) * 20.0) as u8;
                    self.emit_progress(
                        to,
                        80 + share.min(19),
                        format!("Loading ({}s)", waited.as_secs()),
                    );
                }
            },
        )
        .await;

        if ready {
            Ok(())
        } else {
            Err(SupervisorError::HealthTimeout(timeout))
        }
    }

    /// Our own process is serving `target` and answers `/health`
    async fn is_loaded(&self, target: &Path) -> bool {
        self.server.is_running().await
            && self.server.model_path().await.as_deref() == Some(target)
            && self.server.is_healthy().await
    }

    fn emit_progress(&self, role: Role, percent: u8, message: String) {
        self.emit(SwapEvent::Progress {
            role,
            percent,
            message,
        });
    }

    fn emit(&self, event: SwapEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Expected swap time for a model file, for progress display only
pub fn estimate_swap_secs(file_size_bytes: u64) -> u64 {
    match file_size_bytes {
        s if s < 3 * GIB => 8,
        s if s < 6 * GIB => 12,
        s if s < 10 * GIB => 18,
        _ => 25,
    }
}

fn gguf_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("gguf"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::RuntimeAssets;
    use crate::config::ServerConfig;
    use crate::gpu::mocks::StaticGpu;
    use crate::process::mocks::MockProcessManager;
    use httpmock::prelude::*;
    use std::fs;

    fn manager(dir: &Path, roles: RolesConfig) -> (ModelSwapManager, Arc<MockProcessManager>) {
        manager_on(dir, roles, 1, 0)
    }

    fn manager_on(
        dir: &Path,
        roles: RolesConfig,
        port: u16,
        stop_settle_ms: u64,
    ) -> (ModelSwapManager, Arc<MockProcessManager>) {
        let config = ServerConfig {
            port,
            data_dir: dir.to_path_buf(),
            stop_settle_ms: 0,
            health_timeout_ms: 100,
            ..Default::default()
        };
        let processes = Arc::new(MockProcessManager::new());
        let assets = RuntimeAssets::new(dir.join("llama-server"), dir.to_path_buf());
        let server = Arc::new(LlamaServer::with_components(
            config,
            Some(assets),
            processes.clone(),
            Arc::new(StaticGpu::new(24_000, 20_000)),
        ));
        let swap = SwapConfig {
            ready_timeout_secs: 1,
            poll_interval_ms: 50,
            stop_settle_ms,
            ..Default::default()
        };
        (ModelSwapManager::new(server, roles, swap), processes)
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Vision".parse::<Role>(), Ok(Role::Vision));
        assert_eq!(" coder ".parse::<Role>(), Ok(Role::Coder));
        assert!("embedding".parse::<Role>().is_err());
        assert_eq!(Role::Chat.to_string(), "chat");
    }

    #[test]
    fn test_swap_estimate_buckets() {
        assert_eq!(estimate_swap_secs(0), 8);
        assert_eq!(estimate_swap_secs(2 * GIB), 8);
        assert_eq!(estimate_swap_secs(3 * GIB), 12);
        assert_eq!(estimate_swap_secs(7 * GIB), 18);
        assert_eq!(estimate_swap_secs(10 * GIB), 25);
        assert_eq!(estimate_swap_secs(70 * GIB), 25);
    }

    #[tokio::test]
    async fn test_auto_detect() {
        let dir = tempfile::tempdir().unwrap();
        let vision = dir.path().join("vision");
        fs::create_dir_all(&vision).unwrap();
        for name in ["Qwen2.5-7B-Instruct-Q4_K_M.gguf", "deepseek-coder-6.7b.gguf", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::write(vision.join("llava-v1.6-7b.gguf"), b"").unwrap();
        fs::write(vision.join("llava-v1.6-mmproj-f16.gguf"), b"").unwrap();

        let (swap, _) = manager(dir.path(), RolesConfig::default());
        swap.auto_detect(dir.path()).await;

        let models = swap.configured_models().await;
        assert_eq!(
            models[&Role::Chat],
            Some(dir.path().join("Qwen2.5-7B-Instruct-Q4_K_M.gguf"))
        );
        assert_eq!(
            models[&Role::Coder],
            Some(dir.path().join("deepseek-coder-6.7b.gguf"))
        );
        assert_eq!(models[&Role::Vision], Some(vision.join("llava-v1.6-7b.gguf")));
        assert!(swap.has_vision_model().await);
        assert_eq!(
            swap.vision_model_info().await.mmproj,
            Some(vision.join("llava-v1.6-mmproj-f16.gguf"))
        );
    }

    #[tokio::test]
    async fn test_auto_detect_keeps_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mistral-7b.gguf"), b"").unwrap();

        let roles = RolesConfig {
            chat: Some(PathBuf::from("/models/custom-chat.gguf")),
            ..Default::default()
        };
        let (swap, _) = manager(dir.path(), roles);
        swap.auto_detect(dir.path()).await;

        assert_eq!(
            swap.configured_models().await[&Role::Chat],
            Some(PathBuf::from("/models/custom-chat.gguf"))
        );
    }

    #[tokio::test]
    async fn test_auto_detect_fallback_chat() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("llava-7b.gguf"), b"").unwrap();
        fs::write(dir.path().join("phi-3-mini.gguf"), b"").unwrap();

        let (swap, _) = manager(dir.path(), RolesConfig::default());
        swap.auto_detect(dir.path()).await;

        assert_eq!(
            swap.configured_models().await[&Role::Chat],
            Some(dir.path().join("phi-3-mini.gguf"))
        );
        // model without projector
        assert!(!swap.has_vision_model().await);
    }

    #[tokio::test]
    async fn test_unconfigured_role() {
        let dir = tempfile::tempdir().unwrap();
        let (swap, processes) = manager(dir.path(), RolesConfig::default());

        assert!(matches!(
            swap.ensure_role_loaded(Role::Coder).await,
            Err(SupervisorError::RoleNotConfigured(Role::Coder))
        ));
        assert!(processes.spawned().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_swap_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("qwen.gguf");
        fs::write(&model, b"gguf").unwrap();

        let (swap, processes) = manager(dir.path(), RolesConfig::default());
        swap.register_chat(&model).await;
        processes.set_fail_spawns(true);
        let mut events = swap.subscribe();

        let result = swap.ensure_role_loaded(Role::Chat).await;
        assert!(matches!(result, Err(SupervisorError::StartFailed(_))));

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        match last {
            Some(SwapEvent::Completed {
                role,
                success,
                error,
                ..
            }) => {
                assert_eq!(role, Role::Chat);
                assert!(!success);
                assert!(error.is_some());
            }
            other => panic!("expected completion event, got {:?}", other),
        }

        let status = swap.status().await;
        assert!(!status.swapping);
        assert_eq!(status.elapsed_secs, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_swap_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let chat = dir.path().join("qwen.gguf");
        let coder = dir.path().join("qwen-coder.gguf");
        fs::write(&chat, b"gguf").unwrap();
        fs::write(&coder, b"gguf").unwrap();

        let (swap, processes) = manager(dir.path(), RolesConfig::default());
        swap.register_chat(&chat).await;
        swap.register_coder(&coder).await;
        let swap = Arc::new(swap);

        // port 1 never turns healthy, so the first swap sits in its ready wait
        let first = {
            let swap = swap.clone();
            tokio::spawn(async move { swap.ensure_role_loaded(Role::Chat).await })
        };
        let swapping = crate::health::wait_until(
            || {
                let swap = swap.clone();
                async move { swap.status().await.swapping }
            },
            Duration::from_millis(5),
            Duration::from_secs(2),
        )
        .await;
        assert!(swapping);
        let spawned = processes.spawned().await.len();

        assert!(matches!(
            swap.ensure_role_loaded(Role::Coder).await,
            Err(SupervisorError::SwapInProgress)
        ));
        assert_eq!(processes.spawned().await.len(), spawned);

        assert!(matches!(
            first.await.unwrap(),
            Err(SupervisorError::HealthTimeout(_))
        ));
    }

    async fn healthy_port() -> MockServer {
        let http = MockServer::start_async().await;
        http.mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;
        http
    }

    #[tokio::test]
    async fn test_foreign_healthy_server_is_not_loaded_role() {
        let http = healthy_port().await;
        let dir = tempfile::tempdir().unwrap();
        let chat = dir.path().join("qwen.gguf");
        fs::write(&chat, b"gguf").unwrap();

        let roles = RolesConfig {
            chat: Some(chat.clone()),
            ..Default::default()
        };
        let (swap, processes) = manager_on(dir.path(), roles, http.port(), 0);

        // something answers on the port, but nothing of ours runs there yet
        assert!(swap.ensure_role_loaded(Role::Chat).await.unwrap() > Duration::ZERO);
        assert_eq!(processes.spawned().await.len(), 1);
        assert_eq!(swap.server.model_path().await, Some(chat));

        assert_eq!(
            swap.ensure_role_loaded(Role::Chat).await.unwrap(),
            Duration::ZERO
        );
        assert_eq!(processes.spawned().await.len(), 1);
    }

    #[tokio::test]
    async fn test_active_role_rejected_while_swapping() {
        let http = healthy_port().await;
        let dir = tempfile::tempdir().unwrap();
        let chat = dir.path().join("qwen.gguf");
        let coder = dir.path().join("qwen-coder.gguf");
        fs::write(&chat, b"gguf").unwrap();
        fs::write(&coder, b"gguf").unwrap();

        let roles = RolesConfig {
            chat: Some(chat),
            coder: Some(coder.clone()),
            ..Default::default()
        };
        let (swap, _) = manager_on(dir.path(), roles, http.port(), 500);
        let swap = Arc::new(swap);
        swap.ensure_role_loaded(Role::Chat).await.unwrap();

        // stopping chat waits out the settle delay
        let to_coder = {
            let swap = swap.clone();
            tokio::spawn(async move { swap.ensure_role_loaded(Role::Coder).await })
        };
        let swapping = crate::health::wait_until(
            || {
                let swap = swap.clone();
                async move { swap.status().await.swapping }
            },
            Duration::from_millis(5),
            Duration::from_secs(2),
        )
        .await;
        assert!(swapping);

        assert!(matches!(
            swap.ensure_role_loaded(Role::Chat).await,
            Err(SupervisorError::SwapInProgress)
        ));

        to_coder.await.unwrap().unwrap();
        assert_eq!(swap.current_role().await, Role::Coder);
        assert_eq!(swap.server.model_path().await, Some(coder));
    }
}
