//! Rendering Throughput Benchmarks
//!
//! Validates that block rendering stays inside real-time budgets at common
//! buffer sizes and polyphony levels. For real-time use, one block must be
//! rendered before the next is due:
//!
//! ```text
//! time_budget = buffer_size / audio_rate
//! ```
//!
//! | Audio Rate | Buffer 64 | Buffer 256 | Buffer 1024 |
//! |------------|-----------|------------|-------------|
//! | 48 kHz     | 1.33 ms   | 5.33 ms    | 21.33 ms    |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kunquat::prelude::*;

const BUFFER_SIZES: [usize; 3] = [64, 256, 1024];
const VOICE_COUNTS: [usize; 4] = [1, 4, 8, 16];

fn upload(handle: &mut Handle, key: &str, json: serde_json::Value) {
    handle.set_data(key, json.to_string().as_bytes()).unwrap();
}

/// One additive oscillator routed straight to the master output.
fn create_simple_project(buffer_size: usize) -> Handle {
    let mut handle = Handle::new();
    handle.set_audio_buffer_size(buffer_size).unwrap();

    upload(&mut handle, "au_00/p_manifest.json", serde_json::json!({}));
    upload(
        &mut handle,
        "au_00/proc_00/p_manifest.json",
        serde_json::json!({}),
    );
    upload(
        &mut handle,
        "au_00/proc_00/p_proc_type.json",
        serde_json::json!("add"),
    );
    upload(
        &mut handle,
        "au_00/p_connections.json",
        serde_json::json!([
            ["proc_00/C/out_00", "out_00"],
            ["proc_00/C/out_01", "out_01"],
        ]),
    );
    upload(
        &mut handle,
        "p_connections.json",
        serde_json::json!([
            ["au_00/out_00", "out_00"],
            ["au_00/out_01", "out_01"],
        ]),
    );

    handle.validate().unwrap();
    handle
}

/// A pitch → add chain shaped by force, through a mixed-path filter.
fn create_chain_project(buffer_size: usize) -> Handle {
    let mut handle = Handle::new();
    handle.set_audio_buffer_size(buffer_size).unwrap();

    upload(&mut handle, "au_00/p_manifest.json", serde_json::json!({}));
    for (index, proc_type) in [(0, "pitch"), (1, "force"), (2, "add"), (3, "filter")] {
        upload(
            &mut handle,
            &format!("au_00/proc_{:02x}/p_manifest.json", index),
            serde_json::json!({}),
        );
        upload(
            &mut handle,
            &format!("au_00/proc_{:02x}/p_proc_type.json", index),
            serde_json::json!(proc_type),
        );
    }
    upload(
        &mut handle,
        "au_00/proc_03/c/p_f_cutoff.json",
        serde_json::json!(60.0),
    );
    upload(
        &mut handle,
        "au_00/p_connections.json",
        serde_json::json!([
            ["proc_00/C/out_00", "proc_02/C/in_00"],
            ["proc_01/C/out_00", "proc_02/C/in_01"],
            ["proc_02/C/out_00", "proc_03/C/in_02"],
            ["proc_02/C/out_01", "proc_03/C/in_03"],
            ["proc_03/C/out_00", "out_00"],
            ["proc_03/C/out_01", "out_01"],
        ]),
    );
    upload(
        &mut handle,
        "p_connections.json",
        serde_json::json!([
            ["au_00/out_00", "out_00"],
            ["au_00/out_01", "out_01"],
        ]),
    );

    handle.validate().unwrap();
    handle
}

fn bench_block_rendering(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_rendering");

    for &buffer_size in &BUFFER_SIZES {
        group.throughput(Throughput::Elements(buffer_size as u64));
        group.bench_with_input(
            BenchmarkId::new("sine", buffer_size),
            &buffer_size,
            |b, &buffer_size| {
                let mut handle = create_simple_project(buffer_size);
                handle.fire(0, r#"["n+", 0]"#).unwrap();
                b.iter(|| {
                    black_box(handle.mix(buffer_size).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_polyphony(c: &mut Criterion) {
    let mut group = c.benchmark_group("polyphony");

    for &voices in &VOICE_COUNTS {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(
            BenchmarkId::new("chain_voices", voices),
            &voices,
            |b, &voices| {
                let mut handle = create_chain_project(256);
                for ch in 0..voices {
                    handle
                        .fire(ch, &format!(r#"["n+", {}]"#, ch as i64 * 100))
                        .unwrap();
                }
                b.iter(|| {
                    black_box(handle.mix(256).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_expression_evaluation(c: &mut Criterion) {
    c.bench_function("expr_arithmetic", |b| {
        let env = EnvState::new();
        let mut rand = Random::from_seed(7);
        b.iter(|| {
            black_box(
                evaluate(
                    black_box("(1 + 2) * 3 - 4 / 2 ^ 2"),
                    &env,
                    &Value::None,
                    &mut rand,
                )
                .unwrap(),
            );
        });
    });
}

criterion_group!(
    benches,
    bench_block_rendering,
    bench_polyphony,
    bench_expression_evaluation
);
criterion_main!(benches);
