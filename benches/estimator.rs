//! Hot-path heuristics benchmarks
//!
//! Benchmarks for the pure functions run on every model load:
//! - VRAM estimation and layer planning across model sizes
//! - Filename classification over a typical models directory
//! - Document classification of vision output

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use llama_supervisor::classify::{DocumentClassifier, FilenameClassifier, KeywordClassifier};
use llama_supervisor::estimator::{estimate_vram_mb, optimal_gpu_layers};
use std::hint::black_box;

const GB: u64 = 1024 * 1024 * 1024;

const FILENAMES: [&str; 8] = [
    "Qwen2.5-7B-Instruct-Q4_K_M.gguf",
    "qwen2.5-coder-14b-instruct-q5_k_m.gguf",
    "llava-v1.6-mistral-7b.Q4_K_M.gguf",
    "llava-v1.6-mistral-7b-mmproj-f16.gguf",
    "Meta-Llama-3.1-8B-Instruct-Q8_0.gguf",
    "gemma-2-9b-it-Q4_K_M.gguf",
    "MiniCPM-V-2_6-Q4_K_M.gguf",
    "phi-3-mini-4k-instruct.gguf",
];

fn bench_layer_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("layer_planning");

    for size_gb in [2u64, 5, 8, 14, 40] {
        let size = size_gb * GB;
        let required = estimate_vram_mb(size);

        group.bench_with_input(BenchmarkId::new("model_gb", size_gb), &size, |b, &size| {
            b.iter(|| {
                for available in [2_000u64, 6_000, 12_000, 24_000] {
                    black_box(optimal_gpu_layers(
                        black_box(size),
                        required,
                        black_box(available),
                    ));
                }
            });
        });
    }
    group.finish();
}

fn bench_filename_classification(c: &mut Criterion) {
    let classifier = KeywordClassifier::default();

    c.bench_function("classify_models_dir", |b| {
        b.iter(|| {
            for name in FILENAMES {
                black_box(classifier.classify(black_box(name)));
            }
        });
    });
}

fn bench_document_classification(c: &mut Criterion) {
    let classifier = DocumentClassifier::default();
    let short = "Rechnung Nr. 2024-117, Betrag 1.240,00 EUR, zahlbar bis 30.06.";
    let long = format!(
        "{} Sehr geehrte Damen und Herren, anbei die Unterlagen. {}",
        "Lorem ipsum dolor sit amet. ".repeat(200),
        "Mit freundlichen Grüßen"
    );

    let mut group = c.benchmark_group("classify_document");
    group.bench_function("short_invoice", |b| {
        b.iter(|| black_box(classifier.classify(black_box(short))));
    });
    group.bench_function("long_letter", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&long))));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_layer_planning,
    bench_filename_classification,
    bench_document_classification
);
criterion_main!(benches);
