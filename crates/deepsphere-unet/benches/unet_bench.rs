//! Benchmarks for the Spherical U-Net building blocks.
//!
//! Inputs are deterministic ramps; only parameter initialization uses the
//! libtorch RNG, seeded once per benchmark.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p deepsphere-unet
//! ```
//!
//! Criterion HTML reports are written to `target/criterion/`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deepsphere_unet::graph::{ChebLaplacian, LaplacianType, MeshGraph, MeshHierarchy};
use deepsphere_unet::metrics::average_precision;
use deepsphere_unet::model::{SphericalUNet, UNetConfig};
use tch::{Device, Kind, Tensor};

// ─────────────────────────────────────────────────────────────────────────────
// Laplacian propagation
// ─────────────────────────────────────────────────────────────────────────────

/// One `L̂ x` product on rings of growing size with 64 channels.
fn bench_propagate(c: &mut Criterion) {
    let mut group = c.benchmark_group("laplacian_propagate");
    for &nodes in &[768_usize, 3072, 12288] {
        let graph = MeshGraph::ring(nodes).expect("ring graph");
        let lap = ChebLaplacian::new(&graph, LaplacianType::Normalized, Device::Cpu);
        let x = Tensor::arange(nodes as i64 * 64, (Kind::Float, Device::Cpu))
            .reshape([1, nodes as i64, 64])
            * 1e-3;
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &x, |b, x| {
            b.iter(|| lap.propagate(black_box(x)));
        });
    }
    group.finish();
}

// ─────────────────────────────────────────────────────────────────────────────
// Full network
// ─────────────────────────────────────────────────────────────────────────────

/// Inference on a 3 → 3072 node ring hierarchy, batch of 2.
fn bench_unet_inference(c: &mut Criterion) {
    tch::manual_seed(0);
    let hierarchy = MeshHierarchy::synthetic(3, 4).expect("synthetic hierarchy");
    let model = SphericalUNet::new(&hierarchy, &UNetConfig::default(), Device::Cpu)
        .expect("model construction");
    let x = Tensor::arange(2 * 3072 * 16, (Kind::Float, Device::Cpu))
        .reshape([2, 3072, 16])
        .sin();

    c.bench_function("unet_inference_3072_nodes_batch2", |b| {
        b.iter(|| model.forward_inference(black_box(&x)).expect("forward"));
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// AP over one validation epoch's worth of nodes for one label.
fn bench_average_precision(c: &mut Criterion) {
    let n = 64 * 3072;
    let scores: Vec<f32> = (0..n).map(|i| ((i * 7919) % 1000) as f32 / 1000.0).collect();
    let targets: Vec<bool> = (0..n).map(|i| i % 11 == 0).collect();

    c.bench_function("average_precision_196k_nodes", |b| {
        b.iter(|| average_precision(black_box(&scores), black_box(&targets)));
    });
}

criterion_group!(benches, bench_propagate, bench_unet_inference, bench_average_precision);
criterion_main!(benches);
