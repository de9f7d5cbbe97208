//! Forward-pass benchmarks on CPU.
//!
//! Run with: cargo bench --bench forward

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tch::{nn, Device, Kind, Tensor};

use wifi_bimamba::synthetic::synthetic_csi;
use wifi_bimamba::torch::ssm::selective_scan;
use wifi_bimamba::{FusionConfig, FusionModel};

fn bench_selective_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("selective_scan");
    let (batch, d_inner, d_state) = (1, 384, 16);
    let opts = (Kind::Float, Device::Cpu);

    for seqlen in [25i64, 100, 400] {
        let u = Tensor::randn([batch, seqlen, d_inner], opts);
        let delta = Tensor::rand([batch, seqlen, d_inner], opts) * 0.1;
        let a = -Tensor::arange_start(1, d_state + 1, opts).repeat([d_inner, 1]);
        let b = Tensor::randn([batch, seqlen, d_state], opts);
        let cm = Tensor::randn([batch, seqlen, d_state], opts);
        let d = Tensor::ones([d_inner], opts);

        group.throughput(Throughput::Elements(seqlen as u64));
        group.bench_with_input(BenchmarkId::from_parameter(seqlen), &seqlen, |bench, _| {
            bench.iter(|| tch::no_grad(|| selective_scan(black_box(&u), &delta, &a, &b, &cm, &d, None)))
        });
    }
    group.finish();
}

fn bench_fusion_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion_forward");
    let vs = nn::VarStore::new(Device::Cpu);
    let cfg = FusionConfig::default();
    let model = match FusionModel::new(&vs.root(), &cfg) {
        Ok(model) => model,
        Err(e) => panic!("default config must build: {e}"),
    };

    for batch in [1i64, 8] {
        let xs = synthetic_csi(batch, cfg.in_channels, cfg.time_steps, 0);
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |bench, _| {
            bench.iter(|| tch::no_grad(|| nn::ModuleT::forward_t(&model, black_box(&xs), false)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_selective_scan, bench_fusion_forward);
criterion_main!(benches);
