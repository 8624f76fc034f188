//! llama-supervisor - Local supervisor for llama.cpp inference servers
//!
//! Starts and stops llama-server processes on a single GPU host, decides how
//! much of a model fits in VRAM, restarts crashed servers, swaps the loaded
//! model between roles, runs an on-demand vision server and fetches model
//! files with resumable downloads.

pub mod assets;
pub mod classify;
pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod estimator;
pub mod gpu;
pub mod health;
pub mod metrics;
pub mod process;
pub mod server;
pub mod swap;
pub mod vision;
pub mod watchdog;

pub use assets::RuntimeAssets;
pub use client::{ChatClient, ChatMessage, ChatResponse, SamplingParams, Tool, ToolCall};
pub use config::SupervisorConfig;
pub use download::{ArtifactDownloader, DownloadOutcome, DownloadProgress};
pub use error::{SupervisorError, SupervisorResult};
pub use server::{LlamaServer, ServerStatus, VramStrategy};
pub use swap::{ModelSwapManager, Role, SwapEvent, SwapStatus};
pub use vision::{VisionAnalysis, VisionServer, VisionState, VisionStatus};
pub use watchdog::{Watchdog, WatchdogState, WatchdogStats};
