//! Filename and document-text classification
//!
//! Both classifiers are ordered keyword tables so they can be replaced or
//! extended without touching the process-management code.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What a `.gguf` file is, judged by its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Multimodal projector (mmproj)
    Projector,
    Vision,
    Coder,
    /// Matches a known chat family
    Chat,
    /// Unrecognised model, usable as a chat fallback
    Other,
}

/// Maps a file name to an [`ArtifactKind`]
pub trait FilenameClassifier: Send + Sync {
    fn classify(&self, filename: &str) -> ArtifactKind;
}

/// Ordered substring table, first matching rule wins
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(ArtifactKind, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<(ArtifactKind, Vec<String>)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(kind, words)| (kind, words.into_iter().map(|w| w.to_lowercase()).collect()))
            .collect();
        Self { rules }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self::new(vec![
            (ArtifactKind::Projector, words(&["mmproj"])),
            (ArtifactKind::Vision, words(&["llava", "vision", "minicpm"])),
            (ArtifactKind::Coder, words(&["coder"])),
            (
                ArtifactKind::Chat,
                words(&["qwen", "llama", "mistral", "gemma"]),
            ),
        ])
    }
}

impl FilenameClassifier for KeywordClassifier {
    fn classify(&self, filename: &str) -> ArtifactKind {
        let name = filename.to_lowercase();
        self.rules
            .iter()
            .find(|(_, words)| words.iter().any(|w| name.contains(w.as_str())))
            .map(|(kind, _)| *kind)
            .unwrap_or(ArtifactKind::Other)
    }
}

/// Document category guessed from vision-model output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Contract,
    Letter,
    Form,
    Receipt,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Contract => "contract",
            DocumentType::Letter => "letter",
            DocumentType::Form => "form",
            DocumentType::Receipt => "receipt",
        }
    }
}

/// Keyword heuristic over free text (English and German terms)
#[derive(Debug, Clone)]
pub struct DocumentClassifier {
    rules: Vec<(DocumentType, Vec<String>)>,
}

impl DocumentClassifier {
    pub fn new(rules: Vec<(DocumentType, Vec<String>)>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, text: &str) -> Option<DocumentType> {
        let text = text.to_lowercase();
        self.rules
            .iter()
            .find(|(_, words)| words.iter().any(|w| text.contains(w.as_str())))
            .map(|(kind, _)| *kind)
    }
}

impl Default for DocumentClassifier {
    fn default() -> Self {
        let rule = |kind, list: [&str; 2]| (kind, list.iter().map(|s| s.to_string()).collect());
        Self::new(vec![
            rule(DocumentType::Invoice, ["rechnung", "invoice"]),
            rule(DocumentType::Contract, ["vertrag", "contract"]),
            rule(DocumentType::Letter, ["brief", "letter"]),
            rule(DocumentType::Form, ["formular", "form"]),
            rule(DocumentType::Receipt, ["quittung", "receipt"]),
        ])
    }
}

/// Locate the projector belonging to a vision model
///
/// Tries well-known names next to the model, then in `models_dir`, then any
/// `*mmproj*.gguf` in either directory.
pub fn find_projector(model_path: &Path, models_dir: Option<&Path>) -> Option<PathBuf> {
    let model_dir = model_path.parent()?;
    let base = model_path
        .file_name()?
        .to_string_lossy()
        .to_lowercase()
        .trim_end_matches(".gguf")
        .to_string();

    let mut names = vec![
        "mmproj.gguf".to_string(),
        "mmproj-f16.gguf".to_string(),
        "mmproj-f32.gguf".to_string(),
        format!("{}-mmproj.gguf", base),
        format!("{}-mmproj-f16.gguf", base),
    ];
    for quant in ["q4_k_m", "q5_k_m", "q8_0"] {
        if base.contains(quant) {
            names.push(format!("{}.gguf", base.replacen(quant, "mmproj-f16", 1)));
        }
    }

    let mut dirs = vec![model_dir.to_path_buf()];
    if let Some(models_dir) = models_dir
        && models_dir != model_dir
    {
        dirs.push(models_dir.to_path_buf());
    }

    for dir in &dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    dirs.iter().find_map(|dir| first_projector_in(dir))
}

fn first_projector_in(dir: &Path) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|n| {
                        let n = n.to_string_lossy().to_lowercase();
                        n.contains("mmproj") && n.ends_with(".gguf")
                    })
                    .unwrap_or(false)
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}
