//! End-to-end supervisor flows against mock processes and a mock llama-server
//!
//! Processes and the GPU are simulated through the `test-util` mocks; the
//! llama-server HTTP surface is served by httpmock.

use httpmock::prelude::*;
use httpmock::Method::HEAD;
use llama_supervisor::config::{
    DownloadConfig, RolesConfig, ServerConfig, SwapConfig, WatchdogConfig,
};
use llama_supervisor::gpu::mocks::StaticGpu;
use llama_supervisor::health::wait_until;
use llama_supervisor::process::mocks::MockProcessManager;
use llama_supervisor::{
    ArtifactDownloader, LlamaServer, ModelSwapManager, Role, RuntimeAssets, SupervisorError,
    SwapEvent, Watchdog,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GB: u64 = 1024 * 1024 * 1024;

struct Harness {
    server: Arc<LlamaServer>,
    processes: Arc<MockProcessManager>,
    gpu: Arc<StaticGpu>,
    dir: TempDir,
}

fn harness(port: u16, gpu: StaticGpu) -> Harness {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = ServerConfig {
        port,
        data_dir: dir.path().to_path_buf(),
        stop_settle_ms: 0,
        restart_settle_ms: 0,
        health_timeout_ms: 300,
        ..Default::default()
    };
    let processes = Arc::new(MockProcessManager::new());
    let gpu = Arc::new(gpu);
    let assets = RuntimeAssets::new(dir.path().join("llama-server"), dir.path().to_path_buf());
    let server = Arc::new(LlamaServer::with_components(
        config,
        Some(assets),
        processes.clone(),
        gpu.clone(),
    ));
    Harness {
        server,
        processes,
        gpu,
        dir,
    }
}

/// Sparse file of the given apparent size
fn sparse_model(dir: &Path, name: &str, size: u64) -> PathBuf {
    let path = dir.join(name);
    let file = fs::File::create(&path).expect("Failed to create model file");
    file.set_len(size).expect("Failed to size model file");
    path
}

fn fast_swap() -> SwapConfig {
    SwapConfig {
        ready_timeout_secs: 2,
        poll_interval_ms: 20,
        stop_settle_ms: 0,
        ..Default::default()
    }
}

async fn healthy_llama() -> MockServer {
    let http = MockServer::start_async().await;
    http.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(200).json_body(serde_json::json!({ "status": "ok" }));
    })
    .await;
    http
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SwapEvent>) -> Vec<SwapEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_chat_to_vision_swap_clears_vram() {
    let http = healthy_llama().await;
    let h = harness(http.port(), StaticGpu::new(24_000, 7_000).freeing_to(12_000));

    let chat = sparse_model(h.dir.path(), "qwen2.5-3b-instruct-q4_k_m.gguf", 2 * GB);
    let vision = sparse_model(h.dir.path(), "llava-v1.6-7b-q4_k_m.gguf", 5 * GB);
    let projector = sparse_model(h.dir.path(), "projector-f16.gguf", 600 * 1024 * 1024);

    let roles = RolesConfig {
        chat: Some(chat.clone()),
        vision: Some(vision.clone()),
        vision_mmproj: Some(projector.clone()),
        auto_detect: false,
        ..Default::default()
    };
    let swap = ModelSwapManager::new(h.server.clone(), roles, fast_swap());

    swap.ensure_role_loaded(Role::Chat).await.unwrap();
    assert_eq!(h.server.model_path().await, Some(chat.clone()));
    assert_eq!(h.processes.stop_count(), 0);
    // 2 GiB chat needs ~3.4 GB, 7 GB free is enough
    assert_eq!(h.gpu.clear_count(), 0);

    let mut rx = swap.subscribe();
    swap.ensure_role_loaded(Role::Vision).await.unwrap();

    assert_eq!(h.processes.stop_count(), 1);
    // 5 GiB vision needs 7168 MB against 7000 free
    assert_eq!(h.gpu.clear_count(), 1);
    let spawn = h.processes.last_spawn().await.unwrap();
    assert_eq!(spawn.args.model, vision);
    assert_eq!(spawn.args.mmproj, Some(projector));
    assert_eq!(swap.current_role().await, Role::Vision);
    assert!(!swap.status().await.swapping);

    let events = drain(&mut rx);
    assert_eq!(
        events.first(),
        Some(&SwapEvent::Started {
            from: Role::Chat,
            to: Role::Vision,
            estimated_secs: 12,
        })
    );
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SwapEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.first(), Some(&10));
    assert_eq!(percents.last(), Some(&100));
    assert!(matches!(
        events.last(),
        Some(SwapEvent::Completed {
            role: Role::Vision,
            success: true,
            error: None,
            ..
        })
    ));
}

#[tokio::test]
async fn test_with_vision_model_restores_chat() {
    let http = healthy_llama().await;
    let h = harness(http.port(), StaticGpu::new(24_000, 20_000));

    let chat = sparse_model(h.dir.path(), "mistral-7b-instruct.gguf", GB);
    let vision = sparse_model(h.dir.path(), "llava-v1.6-7b.gguf", 2 * GB);
    let roles = RolesConfig {
        chat: Some(chat.clone()),
        vision: Some(vision.clone()),
        auto_detect: false,
        ..Default::default()
    };
    let swap = ModelSwapManager::new(h.server.clone(), roles, fast_swap());
    swap.ensure_role_loaded(Role::Chat).await.unwrap();

    let server = h.server.clone();
    let seen = swap
        .with_vision_model(|| async move { Ok(server.model_path().await) })
        .await
        .unwrap();

    assert_eq!(seen, Some(vision));
    assert_eq!(swap.current_role().await, Role::Chat);
    assert_eq!(h.server.model_path().await, Some(chat));
    assert_eq!(h.processes.spawned().await.len(), 3);
    assert_eq!(h.processes.process_count().await, 1);
}

#[tokio::test]
async fn test_with_vision_model_propagates_work_error() {
    let http = healthy_llama().await;
    let h = harness(http.port(), StaticGpu::new(24_000, 20_000));

    let chat = sparse_model(h.dir.path(), "phi-3-mini.gguf", 1024);
    let vision = sparse_model(h.dir.path(), "moondream2-vision.gguf", 1024);
    let roles = RolesConfig {
        chat: Some(chat.clone()),
        vision: Some(vision),
        auto_detect: false,
        ..Default::default()
    };
    let swap = ModelSwapManager::new(h.server.clone(), roles, fast_swap());
    swap.ensure_role_loaded(Role::Chat).await.unwrap();

    let result: Result<(), SupervisorError> = swap
        .with_vision_model(|| async { Err(SupervisorError::NotRunning) })
        .await;

    assert!(matches!(result, Err(SupervisorError::NotRunning)));
    assert_eq!(swap.current_role().await, Role::Chat);
    assert_eq!(h.server.model_path().await, Some(chat));
}

#[tokio::test]
async fn test_auto_detected_roles_load() {
    let http = healthy_llama().await;
    let h = harness(http.port(), StaticGpu::new(24_000, 20_000));

    let models = h.dir.path().join("models");
    fs::create_dir_all(models.join("vision")).unwrap();
    let chat = sparse_model(&models, "Qwen2.5-7B-Instruct-Q4_K_M.gguf", 1024);
    let coder = sparse_model(&models, "qwen2.5-coder-7b-q4_k_m.gguf", 1024);
    let vision = sparse_model(&models.join("vision"), "llava-v1.6-7b-q4_k_m.gguf", 1024);
    let projector = sparse_model(&models.join("vision"), "llava-v1.6-7b-mmproj-f16.gguf", 1024);

    let roles = RolesConfig {
        auto_detect: true,
        ..Default::default()
    };
    let swap = ModelSwapManager::new(h.server.clone(), roles, fast_swap());
    swap.auto_detect(&models).await;

    let configured = swap.configured_models().await;
    assert_eq!(configured[&Role::Chat], Some(chat));
    assert_eq!(configured[&Role::Coder], Some(coder.clone()));
    assert_eq!(configured[&Role::Vision], Some(vision));
    assert!(swap.has_vision_model().await);
    assert_eq!(swap.vision_model_info().await.mmproj, Some(projector));

    swap.ensure_role_loaded(Role::Coder).await.unwrap();
    assert_eq!(swap.current_role().await, Role::Coder);
    assert_eq!(h.processes.last_spawn().await.unwrap().args.model, coder);
}

#[tokio::test]
async fn test_watchdog_recovers_loaded_role() {
    let http = healthy_llama().await;
    let h = harness(http.port(), StaticGpu::new(24_000, 20_000));
    let chat = sparse_model(h.dir.path(), "llama-3.1-8b-instruct.gguf", 1024);

    let roles = RolesConfig {
        chat: Some(chat.clone()),
        auto_detect: false,
        ..Default::default()
    };
    let swap = ModelSwapManager::new(h.server.clone(), roles, fast_swap());
    swap.ensure_role_loaded(Role::Chat).await.unwrap();

    let watchdog = Arc::new(Watchdog::new(
        h.server.clone(),
        WatchdogConfig {
            check_interval_ms: 20,
            max_failures: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            health_timeout_ms: 200,
            ready_timeout_secs: 2,
            restart_settle_ms: 0,
            ..Default::default()
        },
    ));
    watchdog.start().await.unwrap();

    h.processes.crash_all().await;

    let recovered = wait_until(
        || {
            let watchdog = watchdog.clone();
            async move { watchdog.stats().await.successful_restarts >= 1 }
        },
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await;
    assert!(recovered);
    assert!(h.server.is_running().await);
    assert_eq!(h.server.model_path().await, Some(chat));

    let stats = watchdog.stats().await;
    assert_eq!(stats.failed_restarts, 0);
    assert_eq!(stats.last_restart_reason.as_deref(), Some("Health check failed"));

    watchdog.stop().await;
    assert!(!watchdog.is_running().await);
}

#[tokio::test]
async fn test_resumed_download_is_loadable() {
    let body = "GGUF-weights-0123456789";
    let host = MockServer::start_async().await;
    host.mock_async(|when, then| {
        when.method(HEAD).path("/phi-3-mini.gguf");
        then.status(200).header("content-length", body.len().to_string());
    })
    .await;
    let ranged = host
        .mock_async(|when, then| {
            when.method(GET)
                .path("/phi-3-mini.gguf")
                .header("range", "bytes=5-");
            then.status(206).body(&body[5..]);
        })
        .await;

    let http = healthy_llama().await;
    let h = harness(http.port(), StaticGpu::new(24_000, 20_000));
    let models = h.dir.path().join("models");
    fs::create_dir_all(&models).unwrap();
    fs::write(
        ArtifactDownloader::partial_path(&models, "phi-3-mini.gguf"),
        &body.as_bytes()[..5],
    )
    .unwrap();

    let downloader = ArtifactDownloader::new(DownloadConfig::default()).unwrap();
    let outcome = downloader
        .download(&host.url("/phi-3-mini.gguf"), &models, "phi-3-mini.gguf", None)
        .await
        .unwrap();

    ranged.assert_async().await;
    assert!(outcome.resumed);
    assert_eq!(fs::read_to_string(&outcome.path).unwrap(), body);

    h.server.start(&outcome.path).await.unwrap();
    assert!(h.server.wait_until_ready(Duration::from_secs(2)).await);
    assert_eq!(h.server.model_name().await, "phi-3-mini.gguf");
}
