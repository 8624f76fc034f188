//! Locating the llama-server binary and its shared libraries

use crate::error::{SupervisorError, SupervisorResult};
use std::path::{Path, PathBuf};

pub const BINARY_NAME: &str = "llama-server";

/// Library prefixes shipped with llama.cpp builds
const LIBRARY_MARKERS: [&str; 3] = ["libmtmd.so", "libggml.so", "libllama.so"];

/// Resolved inference runtime: binary plus its library directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeAssets {
    pub binary: PathBuf,
    pub library_dir: PathBuf,
}

impl RuntimeAssets {
    pub fn new(binary: PathBuf, library_dir: PathBuf) -> Self {
        Self {
            binary,
            library_dir,
        }
    }

    /// Resolve the runtime
    ///
    /// Search order: explicit binary, `<data_dir>/bin`, `bin/` next to the
    /// running executable. The library directory is the explicit one if given,
    /// else the first candidate holding llama.cpp shared objects, else the
    /// binary's own directory.
    pub fn discover(
        explicit_binary: Option<&Path>,
        explicit_library: Option<&Path>,
        data_dir: &Path,
    ) -> SupervisorResult<Self> {
        let candidates = binary_candidates(explicit_binary, data_dir);

        let Some(binary) = candidates.iter().find(|p| p.is_file()).cloned() else {
            let searched = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SupervisorError::BinaryNotFound { searched });
        };

        let bin_dir = binary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let library_dir = match explicit_library {
            Some(dir) => dir.to_path_buf(),
            None => library_candidates(&bin_dir)
                .into_iter()
                .find(|dir| has_runtime_libraries(dir))
                .unwrap_or(bin_dir),
        };

        tracing::info!(
            binary = ?binary,
            library_dir = ?library_dir,
            "Found llama-server runtime"
        );

        Ok(Self {
            binary,
            library_dir,
        })
    }

}

/// `LD_LIBRARY_PATH` with `library_dir` prepended to `existing`
pub fn library_search_path(library_dir: &Path, existing: Option<&str>) -> String {
    let dir = library_dir.display().to_string();
    match existing {
        Some(existing) if !existing.is_empty() => format!("{}:{}", dir, existing),
        _ => dir,
    }
}

fn binary_candidates(explicit: Option<&Path>, data_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(data_dir.join("bin").join(BINARY_NAME));
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir.join("bin").join(BINARY_NAME));
    }
    candidates
}

fn library_candidates(bin_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![bin_dir.to_path_buf(), bin_dir.join("lib")];
    if let Some(parent) = bin_dir.parent() {
        dirs.push(parent.join("lib"));
    }
    dirs
}

fn has_runtime_libraries(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(Result::ok).any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        LIBRARY_MARKERS.iter().any(|marker| name.starts_with(marker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_explicit_binary_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom-llama");
        fs::write(&explicit, b"").unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin").join(BINARY_NAME), b"").unwrap();

        let assets = RuntimeAssets::discover(Some(&explicit), None, dir.path()).unwrap();
        assert_eq!(assets.binary, explicit);
        assert_eq!(assets.library_dir, dir.path());
    }

    #[test]
    fn test_data_dir_bin_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        fs::write(bin_dir.join(BINARY_NAME), b"").unwrap();

        let missing = dir.path().join("missing");
        let assets = RuntimeAssets::discover(Some(&missing), None, dir.path()).unwrap();
        assert_eq!(assets.binary, bin_dir.join(BINARY_NAME));
    }

    #[test]
    fn test_library_dir_detection() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("bin");
        let lib_dir = dir.path().join("lib");
        fs::create_dir_all(&bin_dir).unwrap();
        fs::create_dir_all(&lib_dir).unwrap();
        fs::write(bin_dir.join(BINARY_NAME), b"").unwrap();
        fs::write(lib_dir.join("libggml.so.1"), b"").unwrap();

        let assets = RuntimeAssets::discover(None, None, dir.path()).unwrap();
        assert_eq!(assets.library_dir, lib_dir);
    }

    #[test]
    fn test_not_found_lists_searched_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeAssets::discover(None, None, dir.path()).unwrap_err();
        match err {
            SupervisorError::BinaryNotFound { searched } => {
                assert!(searched.contains(&dir.path().display().to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_library_search_path() {
        let dir = Path::new("/opt/llama");
        assert_eq!(library_search_path(dir, None), "/opt/llama");
        assert_eq!(library_search_path(dir, Some("")), "/opt/llama");
        assert_eq!(
            library_search_path(dir, Some("/usr/lib")),
            "/opt/llama:/usr/lib"
        );
    }
}
