//! Child process spawning and teardown for llama-server instances

use crate::assets::library_search_path;
use crate::error::{SupervisorError, SupervisorResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Spawn configuration
// ============================================================================

/// llama-server command line
#[derive(Debug, Clone, PartialEq)]
pub struct ServerArgs {
    pub model: PathBuf,
    pub port: u16,
    pub host: String,
    pub gpu_layers: u32,
    pub context_size: u32,
    pub threads: u32,
    pub mmproj: Option<PathBuf>,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub jinja: bool,
    pub flash_attn: bool,
    pub main_gpu: Option<u32>,
}

impl ServerArgs {
    pub fn new(model: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            model: model.into(),
            port,
            host: "127.0.0.1".to_string(),
            gpu_layers: 99,
            context_size: 4096,
            threads: 0,
            mmproj: None,
            use_mmap: true,
            use_mlock: false,
            jinja: false,
            flash_attn: false,
            main_gpu: None,
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model.display().to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--host".to_string(),
            self.host.clone(),
            "-ngl".to_string(),
            self.gpu_layers.to_string(),
            "-c".to_string(),
            self.context_size.to_string(),
        ];

        if self.jinja {
            args.push("--jinja".to_string());
        }
        if self.threads > 0 {
            args.push("-t".to_string());
            args.push(self.threads.to_string());
        }
        if !self.use_mmap {
            args.push("--no-mmap".to_string());
        }
        if self.use_mlock {
            args.push("--mlock".to_string());
        }
        if self.flash_attn {
            args.push("--flash-attn".to_string());
        }
        if let Some(gpu) = self.main_gpu {
            args.push("--main-gpu".to_string());
            args.push(gpu.to_string());
        }
        if let Some(mmproj) = &self.mmproj {
            args.push("--mmproj".to_string());
            args.push(mmproj.display().to_string());
        }

        args
    }
}

/// Everything needed to launch one server process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Label used for logs and the log file name
    pub name: String,
    pub binary: PathBuf,
    pub library_dir: PathBuf,
    pub args: ServerArgs,
    pub env: Vec<(String, String)>,
    /// Child stdout/stderr go to `<log_dir>/<name>.log` when set
    pub log_dir: Option<PathBuf>,
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new server process
    async fn spawn(&self, config: SpawnConfig) -> SupervisorResult<ProcessHandle>;

    /// Stop a process, SIGTERM first then SIGKILL after `timeout`
    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> SupervisorResult<()>;

    /// False once the process has exited or been stopped
    async fn is_running(&self, handle: &ProcessHandle) -> bool;

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;

    /// Kill whatever holds `port`, including servers started out-of-band
    async fn kill_port_owner(&self, port: u16) -> bool;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<HashMap<String, Child>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn open_log(log_dir: &Path, name: &str) -> std::io::Result<(Stdio, Stdio)> {
        std::fs::create_dir_all(log_dir)?;
        let log_path = log_dir.join(format!("{}.log", name));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let stderr = log_file.try_clone()?;
        Ok((Stdio::from(log_file), Stdio::from(stderr)))
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: SpawnConfig) -> SupervisorResult<ProcessHandle> {
        let mut cmd = Command::new(&config.binary);
        cmd.args(config.args.to_args());

        let existing = std::env::var("LD_LIBRARY_PATH").ok();
        cmd.env(
            "LD_LIBRARY_PATH",
            library_search_path(&config.library_dir, existing.as_deref()),
        );
        if config.library_dir.is_dir() {
            cmd.current_dir(&config.library_dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let (stdout, stderr) = match &config.log_dir {
            Some(dir) => match Self::open_log(dir, &config.name) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        log_dir = ?dir,
                        "Failed to open log file, discarding server output"
                    );
                    (Stdio::null(), Stdio::null())
                }
            },
            None => (Stdio::null(), Stdio::null()),
        };

        let child = cmd
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::StartFailed)?;

        let pid = child.id().unwrap_or_default();
        let handle_id = format!("process_{}", pid);

        tracing::info!(
            name = %config.name,
            model = ?config.args.model,
            port = config.args.port,
            gpu_layers = config.args.gpu_layers,
            pid = pid,
            "llama-server process spawned"
        );

        self.processes
            .write()
            .await
            .insert(handle_id.clone(), child);

        Ok(ProcessHandle { id: handle_id })
    }

    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> SupervisorResult<()> {
        let Some(mut child) = self.processes.write().await.remove(&handle.id) else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                let pid = Pid::from_raw(pid as i32);
                let _ = kill(pid, Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        tracing::info!("Process stopped gracefully");
                    }
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                let _ = child.kill().await;
            }
        }

        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let mut processes = self.processes.write().await;
        let Some(child) = processes.get_mut(&handle.id) else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(handle = %handle.id, status = %status, "Process exited");
                processes.remove(&handle.id);
                false
            }
            Err(e) => {
                tracing::warn!(handle = %handle.id, error = %e, "Failed to poll process");
                false
            }
        }
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }

    async fn kill_port_owner(&self, port: u16) -> bool {
        let fuser = Command::new("fuser")
            .arg("-k")
            .arg(format!("{}/tcp", port))
            .output()
            .await;

        match fuser {
            Ok(output) if output.status.success() => {
                tracing::info!(port = port, "Killed process holding port");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(error = %e, "fuser unavailable, falling back to pkill");
                Command::new("pkill")
                    .args(["-f", crate::assets::BINARY_NAME])
                    .output()
                    .await
                    .map(|o| o.status.success())
                    .unwrap_or(false)
            }
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(any(test, feature = "test-util"))]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    /// Mock process manager for testing
    pub struct MockProcessManager {
        processes: Arc<RwLock<HashMap<String, ProcessState>>>,
        history: Arc<RwLock<Vec<SpawnConfig>>>,
        port_kills: Arc<RwLock<Vec<u16>>>,
        next_pid: AtomicU32,
        stops: AtomicUsize,
        fail_spawns: AtomicBool,
    }

    #[derive(Debug, Clone)]
    struct ProcessState {
        pid: u32,
        running: bool,
        config: SpawnConfig,
    }

    impl Default for MockProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockProcessManager {
        pub fn new() -> Self {
            Self {
                processes: Arc::new(RwLock::new(HashMap::new())),
                history: Arc::new(RwLock::new(Vec::new())),
                port_kills: Arc::new(RwLock::new(Vec::new())),
                next_pid: AtomicU32::new(1000),
                stops: AtomicUsize::new(0),
                fail_spawns: AtomicBool::new(false),
            }
        }

        /// Make subsequent spawns fail like a missing executable
        pub fn set_fail_spawns(&self, fail: bool) {
            self.fail_spawns.store(fail, Ordering::SeqCst);
        }

        /// Number of live processes
        pub async fn process_count(&self) -> usize {
            self.processes
                .read()
                .await
                .values()
                .filter(|p| p.running)
                .count()
        }

        /// Every spawn request seen, oldest first
        pub async fn spawned(&self) -> Vec<SpawnConfig> {
            self.history.read().await.clone()
        }

        pub async fn last_spawn(&self) -> Option<SpawnConfig> {
            self.history.read().await.last().cloned()
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        pub async fn port_kills(&self) -> Vec<u16> {
            self.port_kills.read().await.clone()
        }

        /// Simulate every live process crashing
        pub async fn crash_all(&self) {
            for state in self.processes.write().await.values_mut() {
                state.running = false;
            }
        }

        pub async fn get_config(&self, handle: &ProcessHandle) -> Option<SpawnConfig> {
            let processes = self.processes.read().await;
            processes.get(&handle.id).map(|p| p.config.clone())
        }
    }

    #[async_trait]
    impl ProcessManager for MockProcessManager {
        async fn spawn(&self, config: SpawnConfig) -> SupervisorResult<ProcessHandle> {
            self.history.write().await.push(config.clone());

            if self.fail_spawns.load(Ordering::SeqCst) {
                return Err(SupervisorError::StartFailed(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "mock spawn failure",
                )));
            }

            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            let handle_id = format!("mock_process_{}", pid);

            self.processes.write().await.insert(
                handle_id.clone(),
                ProcessState {
                    pid,
                    running: true,
                    config,
                },
            );

            Ok(ProcessHandle { id: handle_id })
        }

        async fn stop(&self, handle: ProcessHandle, _timeout: Duration) -> SupervisorResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.processes.write().await.remove(&handle.id);
            Ok(())
        }

        async fn is_running(&self, handle: &ProcessHandle) -> bool {
            let processes = self.processes.read().await;
            processes
                .get(&handle.id)
                .map(|p| p.running)
                .unwrap_or(false)
        }

        async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
            let processes = self.processes.read().await;
            processes.get(&handle.id).map(|p| p.pid)
        }

        async fn kill_port_owner(&self, port: u16) -> bool {
            self.port_kills.write().await.push(port);
            false
        }
    }
}
