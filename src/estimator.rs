//! VRAM and GPU-layer estimation
//!
//! Everything here is a heuristic over file sizes. Model weights are never
//! parsed; the layer table is an approximation of common GGUF families.

use std::path::Path;

/// Sentinel for "offload every layer"
pub const ALL_LAYERS: u32 = 99;

/// Fixed runtime + context allocation overhead
pub const BASE_OVERHEAD_MB: u64 = 1024;

/// Used when the model file cannot be stat'ed
pub const FALLBACK_ESTIMATE_MB: u64 = 6000;

const GB: u64 = 1024 * 1024 * 1024;

/// (upper bound in bytes, total layers)
const LAYER_BUCKETS: [(u64, u32); 4] = [(3 * GB, 24), (6 * GB, 32), (10 * GB, 40), (25 * GB, 48)];
const LAYERS_ABOVE_BUCKETS: u32 = 80;

/// Conservative VRAM requirement in MB for a model file of the given size
///
/// `size_mb * 1.2 + 1024`: the factor covers KV cache, the constant covers
/// runtime and context buffers. Monotonic in `file_size_bytes`.
pub fn estimate_vram_mb(file_size_bytes: u64) -> u64 {
    let size_mb = file_size_bytes / (1024 * 1024);
    // integer form of size_mb * 1.2, rounded down
    size_mb + size_mb / 5 + BASE_OVERHEAD_MB
}

/// Estimate from the file on disk, falling back to a fixed guess
pub fn estimate_model_vram(model_path: &Path) -> u64 {
    match std::fs::metadata(model_path) {
        Ok(meta) => estimate_vram_mb(meta.len()),
        Err(e) => {
            tracing::debug!(
                path = ?model_path,
                error = %e,
                fallback_mb = FALLBACK_ESTIMATE_MB,
                "Cannot stat model, using fallback VRAM estimate"
            );
            FALLBACK_ESTIMATE_MB
        }
    }
}

/// Approximate total layer count from the file size bucket
pub fn total_layers_for_size(file_size_bytes: u64) -> u32 {
    LAYER_BUCKETS
        .iter()
        .find(|(limit, _)| file_size_bytes < *limit)
        .map(|(_, layers)| *layers)
        .unwrap_or(LAYERS_ABOVE_BUCKETS)
}

/// GPU layer count that fits `available_mb` for a model needing `required_mb`
///
/// Returns [`ALL_LAYERS`] when everything fits, otherwise scales the bucketed
/// layer count down proportionally. Always within `1..=99`.
pub fn optimal_gpu_layers(file_size_bytes: u64, required_mb: u64, available_mb: u64) -> u32 {
    if available_mb >= required_mb {
        return ALL_LAYERS;
    }

    let total = total_layers_for_size(file_size_bytes);
    let ratio = available_mb as f64 / required_mb as f64;
    let layers = (f64::from(total) * ratio.min(1.0)).floor() as u32;

    layers.clamp(1, ALL_LAYERS)
}

/// Layer plan for a model file against a VRAM budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPlan {
    pub gpu_layers: u32,
    pub required_mb: u64,
    pub available_mb: u64,
}

impl LayerPlan {
    pub fn is_partial(&self) -> bool {
        self.gpu_layers < ALL_LAYERS
    }
}

/// Plan GPU offload for the model at `model_path`
///
/// `available_mb` is free VRAM after the caller's reserve has been subtracted.
pub fn plan_gpu_layers(model_path: &Path, available_mb: u64) -> LayerPlan {
    let size = std::fs::metadata(model_path).map(|m| m.len()).unwrap_or(0);
    let required_mb = if size == 0 {
        FALLBACK_ESTIMATE_MB
    } else {
        estimate_vram_mb(size)
    };

    LayerPlan {
        gpu_layers: optimal_gpu_layers(size, required_mb, available_mb),
        required_mb,
        available_mb,
    }
}
