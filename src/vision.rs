//! On-demand vision server
//!
//! A second llama-server with a multimodal projector, started on first use
//! and stopped after an idle period. The idle timer never stops the process
//! while a request is in flight.

use crate::assets::RuntimeAssets;
use crate::classify::{DocumentClassifier, DocumentType};
use crate::client::{ChatClient, ChatMessage, ContentPart};
use crate::config::VisionConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::estimator;
use crate::gpu::GpuProbe;
use crate::health::{self, HealthProbe};
use crate::process::{ProcessHandle, ProcessManager, ServerArgs, SpawnConfig};
use crate::swap::Role;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

const DEFAULT_PROMPT: &str = "Describe this image in detail.

If it is a document (letter, invoice, form, contract or similar):
1. Transcribe all readable text verbatim
2. Name the document type
3. List key data such as dates, amounts, names and addresses
4. Describe visual elements such as logos, stamps and signatures

If it is a photo or graphic, describe the scene, the objects and any people.

Start with a short summary, then list the details.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisionStatus {
    pub state: VisionState,
    pub running: bool,
    pub ready: bool,
    pub model_name: String,
    pub port: u16,
    pub last_used: Option<DateTime<Utc>>,
    pub idle_timeout: Option<Duration>,
    pub time_until_stop: Option<Duration>,
    pub active_requests: usize,
    pub cpu_only: bool,
}

/// Result of [`VisionServer::analyze_image`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisionAnalysis {
    pub description: String,
    pub document_type: Option<DocumentType>,
}

struct Inner {
    config: VisionConfig,
    idle_timeout: Option<Duration>,
    state: VisionState,
    handle: Option<ProcessHandle>,
    model_name: String,
    last_used: Option<DateTime<Utc>>,
    last_used_at: Option<Instant>,
    active_requests: usize,
    cpu_only: bool,
    idle_token: Option<CancellationToken>,
    process_token: Option<CancellationToken>,
}

/// Supervisor for the on-demand vision llama-server
#[derive(Clone)]
pub struct VisionServer {
    inner: Arc<Mutex<Inner>>,
    assets: RuntimeAssets,
    process_manager: Arc<dyn ProcessManager>,
    gpu: Arc<dyn GpuProbe>,
    probe: HealthProbe,
    documents: Arc<DocumentClassifier>,
    log_dir: Option<PathBuf>,
}

impl VisionServer {
    pub fn new(
        config: VisionConfig,
        assets: RuntimeAssets,
        process_manager: Arc<dyn ProcessManager>,
        gpu: Arc<dyn GpuProbe>,
    ) -> Self {
        Self {
            probe: HealthProbe::new(config.health_timeout()),
            inner: Arc::new(Mutex::new(Inner {
                idle_timeout: config.idle_timeout(),
                config,
                state: VisionState::Stopped,
                handle: None,
                model_name: String::new(),
                last_used: None,
                last_used_at: None,
                active_requests: 0,
                cpu_only: false,
                idle_token: None,
                process_token: None,
            })),
            assets,
            process_manager,
            gpu,
            documents: Arc::new(DocumentClassifier::default()),
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn with_document_classifier(mut self, classifier: DocumentClassifier) -> Self {
        self.documents = Arc::new(classifier);
        self
    }

    /// Start if needed and block until the server answers `/health`
    pub async fn ensure_running(&self) -> SupervisorResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            VisionState::Ready => {
                Self::mark_used(&mut inner);
                self.arm_idle_locked(&mut inner);
                return Ok(());
            }
            VisionState::Starting => {}
            VisionState::Stopped | VisionState::Stopping => {
                self.start_locked(&mut inner).await?;
            }
        }
        drop(inner);

        self.wait_ready().await
    }

    /// Spawn the process; readiness is awaited in the background
    pub async fn start(&self) -> SupervisorResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != VisionState::Stopped {
            return Ok(());
        }
        self.start_locked(&mut inner).await
    }

    pub async fn stop(&self) -> SupervisorResult<()> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    /// Record activity and restart the idle countdown
    pub async fn touch(&self) {
        let mut inner = self.inner.lock().await;
        Self::mark_used(&mut inner);
        self.arm_idle_locked(&mut inner);
    }

    /// Zero disables idle eviction
    pub async fn set_idle_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock().await;
        inner.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        tracing::info!(idle_timeout_ms = timeout.as_millis() as u64, "Vision idle timeout changed");
        self.arm_idle_locked(&mut inner);
    }

    /// Takes effect on the next start
    pub async fn set_model(&self, model: impl Into<PathBuf>, mmproj: Option<PathBuf>) {
        let model = model.into();
        tracing::info!(model = ?model, mmproj = ?mmproj, "Vision model configured");
        let mut inner = self.inner.lock().await;
        inner.config.model_path = Some(model);
        inner.config.mmproj_path = mmproj;
    }

    /// 0 runs on the CPU only; takes effect on the next start
    pub async fn set_gpu_layers(&self, layers: u32) {
        let layers = layers.min(estimator::ALL_LAYERS);
        self.inner.lock().await.config.gpu_layers = layers;
        tracing::info!(gpu_layers = layers, "Vision GPU layers changed");
    }

    pub async fn gpu_layers(&self) -> u32 {
        self.inner.lock().await.config.gpu_layers
    }

    pub async fn state(&self) -> VisionState {
        self.inner.lock().await.state
    }

    pub async fn is_healthy(&self) -> bool {
        let url = {
            let inner = self.inner.lock().await;
            if inner.state == VisionState::Stopped {
                return false;
            }
            inner.config.base_url()
        };
        self.probe.is_healthy(&url).await
    }

    pub async fn status(&self) -> VisionStatus {
        let inner = self.inner.lock().await;
        let running = inner.state != VisionState::Stopped;
        let time_until_stop = match (running, inner.idle_timeout, inner.last_used_at) {
            (true, Some(timeout), Some(at)) => timeout.checked_sub(at.elapsed()),
            _ => None,
        };

        VisionStatus {
            state: inner.state,
            running,
            ready: inner.state == VisionState::Ready,
            model_name: inner.model_name.clone(),
            port: inner.config.port,
            last_used: inner.last_used,
            idle_timeout: inner.idle_timeout,
            time_until_stop,
            active_requests: inner.active_requests,
            cpu_only: inner.cpu_only,
        }
    }

    /// Describe a base64 JPEG, starting the server if needed
    ///
    /// An empty prompt uses a generic document/photo analysis prompt.
    pub async fn analyze_image(
        &self,
        image_base64: &str,
        prompt: &str,
    ) -> SupervisorResult<VisionAnalysis> {
        self.ensure_running().await?;

        let request = self.begin_request().await;
        let result = self.run_analysis(image_base64, prompt).await;
        request.finish().await;
        result
    }

    async fn run_analysis(&self, image_base64: &str, prompt: &str) -> SupervisorResult<VisionAnalysis> {
        let (base_url, model_name, timeout, max_tokens) = {
            let inner = self.inner.lock().await;
            (
                inner.config.base_url(),
                inner.model_name.clone(),
                inner.config.analyze_timeout(),
                inner.config.max_tokens,
            )
        };
        let prompt = if prompt.trim().is_empty() {
            DEFAULT_PROMPT
        } else {
            prompt
        };

        let message = ChatMessage::multimodal(
            "user",
            vec![
                ContentPart::text(prompt),
                ContentPart::jpeg_base64(image_base64),
            ],
        );
        let description = ChatClient::new(base_url, timeout)
            .with_model_name(model_name)
            .complete(vec![message], max_tokens, timeout)
            .await?;

        tracing::info!(chars = description.len(), "Image analysis complete");
        let document_type = self.documents.classify(&description);
        Ok(VisionAnalysis {
            description,
            document_type,
        })
    }

    async fn begin_request(&self) -> ActiveRequest {
        let mut inner = self.inner.lock().await;
        inner.active_requests += 1;
        Self::mark_used(&mut inner);
        crate::metrics::update_vision_active_requests(inner.active_requests);
        tracing::debug!(active_requests = inner.active_requests, "Vision request started");
        ActiveRequest {
            server: Some(self.clone()),
        }
    }

    async fn end_request(&self) {
        let mut inner = self.inner.lock().await;
        inner.active_requests = inner.active_requests.saturating_sub(1);
        Self::mark_used(&mut inner);
        crate::metrics::update_vision_active_requests(inner.active_requests);
        self.arm_idle_locked(&mut inner);
    }

    async fn wait_ready(&self) -> SupervisorResult<()> {
        let (interval, timeout) = {
            let inner = self.inner.lock().await;
            (inner.config.poll_interval(), inner.config.ready_timeout())
        };

        let ready = health::wait_until(
            || async { self.inner.lock().await.state == VisionState::Ready },
            interval,
            timeout,
        )
        .await;

        if ready {
            Ok(())
        } else {
            Err(SupervisorError::HealthTimeout(timeout))
        }
    }

    async fn start_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> SupervisorResult<()> {
        let model = inner
            .config
            .model_path
            .clone()
            .ok_or(SupervisorError::RoleNotConfigured(Role::Vision))?;
        if !model.is_file() {
            return Err(SupervisorError::ModelNotFound(model));
        }

        let mut gpu_layers = inner.config.gpu_layers;
        if gpu_layers > 0 {
            let required = estimator::estimate_model_vram(&model);
            let available = match self.gpu.vram_info().await {
                Some(info) => info.free_mb,
                None => {
                    tracing::info!("GPU query unavailable for vision server");
                    0
                }
            };
            let margin = inner.config.vram_safety_margin_mb;
            tracing::info!(required_mb = required, available_mb = available, margin_mb = margin, "Vision VRAM check");
            if available < required + margin {
                tracing::warn!(
                    required_mb = required,
                    available_mb = available,
                    "Not enough VRAM for vision model, running on CPU"
                );
                gpu_layers = 0;
            }
        }
        let cpu_only = gpu_layers == 0;

        let args = ServerArgs {
            model: model.clone(),
            port: inner.config.port,
            host: inner.config.host.clone(),
            gpu_layers,
            context_size: inner.config.context_size,
            threads: 0,
            mmproj: inner.config.mmproj_path.clone(),
            use_mmap: true,
            use_mlock: false,
            jinja: false,
            flash_attn: !cpu_only,
            main_gpu: inner.config.main_gpu,
        };
        let env = if cpu_only {
            vec![("CUDA_VISIBLE_DEVICES".to_string(), String::new())]
        } else {
            Vec::new()
        };
        let spawn_config = SpawnConfig {
            name: "vision-server".to_string(),
            binary: self.assets.binary.clone(),
            library_dir: self.assets.library_dir.clone(),
            args,
            env,
            log_dir: self.log_dir.clone(),
        };

        let handle = self.process_manager.spawn(spawn_config).await?;

        let token = CancellationToken::new();
        inner.state = VisionState::Starting;
        inner.handle = Some(handle.clone());
        inner.model_name = model
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        inner.cpu_only = cpu_only;
        inner.process_token = Some(token.clone());
        Self::mark_used(inner);

        tracing::info!(
            model = %inner.model_name,
            port = inner.config.port,
            gpu_layers,
            mmproj = ?inner.config.mmproj_path,
            "Vision server starting"
        );
        crate::metrics::record_vision_start(cpu_only);

        self.spawn_exit_watcher(handle, inner.config.poll_interval(), token.clone());
        self.spawn_readiness_check(
            inner.config.base_url(),
            inner.config.poll_interval(),
            inner.config.ready_timeout(),
            token,
        );
        Ok(())
    }

    async fn stop_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> SupervisorResult<()> {
        if inner.state == VisionState::Stopped {
            return Ok(());
        }

        tracing::info!(model = %inner.model_name, "Stopping vision server");
        inner.state = VisionState::Stopping;
        if let Some(token) = inner.idle_token.take() {
            token.cancel();
        }
        if let Some(token) = inner.process_token.take() {
            token.cancel();
        }

        let result = match inner.handle.take() {
            Some(handle) => {
                self.process_manager
                    .stop(handle, inner.config.stop_timeout())
                    .await
            }
            None => Ok(()),
        };

        inner.state = VisionState::Stopped;
        inner.model_name.clear();
        tracing::info!("Vision server stopped");
        result
    }

    fn mark_used(inner: &mut Inner) {
        inner.last_used = Some(Utc::now());
        inner.last_used_at = Some(Instant::now());
    }

    /// Replace the idle timer; no-op while stopped or with eviction disabled
    fn arm_idle_locked(&self, inner: &mut Inner) {
        if let Some(token) = inner.idle_token.take() {
            token.cancel();
        }
        let Some(timeout) = inner.idle_timeout else {
            return;
        };
        if !matches!(inner.state, VisionState::Starting | VisionState::Ready) {
            return;
        }

        let token = CancellationToken::new();
        inner.idle_token = Some(token.clone());
        let server = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => server.on_idle(token).await,
            }
        });
    }

    async fn on_idle(&self, token: CancellationToken) {
        let mut inner = self.inner.lock().await;
        if token.is_cancelled() {
            return;
        }

        if inner.active_requests > 0 {
            tracing::info!(
                active_requests = inner.active_requests,
                "Vision idle timeout reached with requests in flight, rearming"
            );
            self.arm_idle_locked(&mut inner);
            return;
        }

        tracing::info!(
            idle_timeout_secs = inner.idle_timeout.map(|t| t.as_secs_f64()).unwrap_or_default(),
            "Vision server idle, stopping"
        );
        crate::metrics::record_vision_idle_stop();
        if let Err(e) = self.stop_locked(&mut inner).await {
            tracing::warn!(error = %e, "Failed to stop idle vision server");
        }
    }

    fn spawn_exit_watcher(&self, handle: ProcessHandle, interval: Duration, token: CancellationToken) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if server.process_manager.is_running(&handle).await {
                            continue;
                        }
                        let mut inner = server.inner.lock().await;
                        if inner.handle.as_ref() == Some(&handle) {
                            inner.handle = None;
                            inner.state = VisionState::Stopped;
                            inner.model_name.clear();
                            if let Some(idle) = inner.idle_token.take() {
                                idle.cancel();
                            }
                            inner.process_token = None;
                            tracing::warn!("Vision server exited unexpectedly");
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
        interval: Duration,
        timeout: Duration,
        token: CancellationToken,
    ) {
        let server = self.clone();
        tokio::spawn(async move {
            let ready = tokio::select! {
                _ = token.cancelled() => return,
                ready = server.probe.wait_ready(&base_url, interval, timeout) => ready,
            };

            let mut inner = server.inner.lock().await;
            if token.is_cancelled() {
                return;
            }

            if ready {
                inner.state = VisionState::Ready;
                tracing::info!(model = %inner.model_name, "Vision server ready");
                server.arm_idle_locked(&mut inner);
            } else {
                tracing::warn!(timeout_secs = timeout.as_secs(), "Vision server not healthy in time, stopping");
                if let Err(e) = server.stop_locked(&mut inner).await {
                    tracing::warn!(error = %e, "Failed to stop vision server");
                }
            }
        });
    }
}

/// In-flight request marker; always decrements the counter exactly once
struct ActiveRequest {
    server: Option<VisionServer>,
}

impl ActiveRequest {
    async fn finish(mut self) {
        if let Some(server) = self.server.take() {
            server.end_request().await;
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        // cancelled mid-request
        if let Some(server) = self.server.take() {
            tokio::spawn(async move { server.end_request().await });
        }
    }
}
