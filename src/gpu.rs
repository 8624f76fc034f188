//! GPU memory queries and cleanup
//!
//! VRAM state comes from nvidia-smi. Every caller re-queries right before a
//! decision; nothing here is cached.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;

/// Snapshot of one GPU's memory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VramInfo {
    pub name: String,
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub percent_used: f64,
}

impl VramInfo {
    pub fn new(name: impl Into<String>, total_mb: u64, used_mb: u64, free_mb: u64) -> Self {
        let percent_used = if total_mb > 0 {
            used_mb as f64 / total_mb as f64 * 100.0
        } else {
            0.0
        };
        Self {
            name: name.into(),
            total_mb,
            used_mb,
            free_mb,
            percent_used,
        }
    }
}

/// A compute process holding GPU memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub used_mb: u64,
}

impl GpuProcess {
    /// Processes owned by llama.cpp / ggml runtimes
    pub fn is_inference(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("llama") || name.contains("ggml")
    }
}

/// Source of GPU memory information
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Current VRAM, `None` when no GPU tooling is available
    async fn vram_info(&self) -> Option<VramInfo>;

    /// Compute processes currently on the GPU
    async fn processes(&self) -> Vec<GpuProcess>;

    /// Kill every inference process on the GPU, returns how many were signalled
    async fn clear_inference_processes(&self) -> usize;
}

/// Probe backed by the `nvidia-smi` CLI
pub struct NvidiaSmi {
    settle: Duration,
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self {
            settle: Duration::from_secs(2),
        }
    }

    /// Pause after clearing so the driver releases memory
    pub fn with_settle(settle: Duration) -> Self {
        Self { settle }
    }

    async fn query(args: &[&str]) -> Option<String> {
        let output = Command::new("nvidia-smi").args(args).output().await;

        match output {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(stderr = %stderr, "nvidia-smi query failed");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "nvidia-smi not available");
                None
            }
        }
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmi {
    async fn vram_info(&self) -> Option<VramInfo> {
        let stdout = Self::query(&[
            "--query-gpu=name,memory.total,memory.used,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .await?;
        parse_vram_info(&stdout)
    }

    async fn processes(&self) -> Vec<GpuProcess> {
        match Self::query(&[
            "--query-compute-apps=pid,name,used_memory",
            "--format=csv,noheader,nounits",
        ])
        .await
        {
            Some(stdout) => parse_processes(&stdout),
            None => Vec::new(),
        }
    }

    async fn clear_inference_processes(&self) -> usize {
        tracing::info!("Clearing inference processes from GPU");

        let mut killed = 0;
        for process in self.processes().await {
            if !process.is_inference() {
                continue;
            }
            if kill_pid(process.pid) {
                tracing::info!(
                    pid = process.pid,
                    name = %process.name,
                    used_mb = process.used_mb,
                    "Killed GPU process"
                );
                killed += 1;
            }
        }

        // Catches servers that are still loading and not yet listed
        let _ = Command::new("pkill")
            .args(["-9", "-f", "llama-server"])
            .output()
            .await;

        tokio::time::sleep(self.settle).await;

        if let Some(info) = self.vram_info().await {
            tracing::info!(
                free_mb = info.free_mb,
                total_mb = info.total_mb,
                killed = killed,
                "VRAM after cleanup"
            );
        }

        killed
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid = pid, error = %e, "Failed to kill GPU process");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) -> bool {
    false
}

/// Parse the first GPU line of `name, total, used, free`
pub fn parse_vram_info(stdout: &str) -> Option<VramInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }

    let total = fields[1].parse().ok()?;
    let used = fields[2].parse().ok()?;
    let free = fields[3].parse().ok()?;
    Some(VramInfo::new(fields[0], total, used, free))
}

/// Parse `pid, name, used_memory` lines, skipping malformed ones
pub fn parse_processes(stdout: &str) -> Vec<GpuProcess> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                return None;
            }
            Some(GpuProcess {
                pid: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                used_mb: fields[2].parse().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(any(test, feature = "test-util"))]
pub mod mocks {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// GPU probe with scripted memory figures
    pub struct StaticGpu {
        info: Arc<RwLock<Option<VramInfo>>>,
        free_after_clear: Option<u64>,
        queries: AtomicUsize,
        clears: AtomicUsize,
    }

    impl StaticGpu {
        pub fn new(total_mb: u64, free_mb: u64) -> Self {
            Self {
                info: Arc::new(RwLock::new(Some(VramInfo::new(
                    "Mock GPU",
                    total_mb,
                    total_mb.saturating_sub(free_mb),
                    free_mb,
                )))),
                free_after_clear: None,
                queries: AtomicUsize::new(0),
                clears: AtomicUsize::new(0),
            }
        }

        /// No GPU tooling on this host
        pub fn unavailable() -> Self {
            Self {
                info: Arc::new(RwLock::new(None)),
                free_after_clear: None,
                queries: AtomicUsize::new(0),
                clears: AtomicUsize::new(0),
            }
        }

        /// Free memory reported once a clear has run
        pub fn freeing_to(mut self, free_mb: u64) -> Self {
            self.free_after_clear = Some(free_mb);
            self
        }

        pub async fn set_free(&self, free_mb: u64) {
            if let Some(info) = self.info.write().await.as_mut() {
                *info = VramInfo::new(
                    info.name.clone(),
                    info.total_mb,
                    info.total_mb.saturating_sub(free_mb),
                    free_mb,
                );
            }
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }

        pub fn clear_count(&self) -> usize {
            self.clears.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GpuProbe for StaticGpu {
        async fn vram_info(&self) -> Option<VramInfo> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.info.read().await.clone()
        }

        async fn processes(&self) -> Vec<GpuProcess> {
            Vec::new()
        }

        async fn clear_inference_processes(&self) -> usize {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if let Some(free) = self.free_after_clear {
                self.set_free(free).await;
            }
            0
        }
    }
}
