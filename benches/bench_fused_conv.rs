//! Fused convolution benchmarks.
//!
//! Shapes: MobileNetV2-style inverted residual blocks (Cdc), plus one
//! channels-first dense layer (DenseGemm).
//! Compared: fused engine vs the three scalar reference convolutions.
//! Reported: elements of output per second.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use fusedconv_kernels::{
    ActivationKind, ConvEngine, ConvStage, EngineConfig, FusedPipelineDescriptor, StageParams, TensorLayout,
};
use scalar_ops::activations::{clamp, identity};
use scalar_ops::{conv2d_nhwc, ConvShape};

/// (size, src channels, expansion, stride)
const BLOCKS: &[(usize, usize, usize, usize)] = &[
    (56, 24, 6, 1),
    (28, 32, 6, 1),
    (28, 32, 6, 2),
    (14, 96, 6, 1),
    (7, 160, 6, 1),
];

fn pseudo_random(n: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(747796405).wrapping_add(2891336453);
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

fn relu6() -> ActivationKind {
    ActivationKind::RestrictRange { lower: 0.0, upper: 6.0 }
}

fn block(size: usize, c: usize, expand: usize, stride: usize) -> FusedPipelineDescriptor {
    let mid = c * expand;
    let c0 = ConvStage::pointwise(size, size, c, mid, relu6()).unwrap();
    let c1 = ConvStage::depthwise(size, size, mid, 3, stride, 1, relu6()).unwrap();
    let c2 = ConvStage::pointwise(c1.dst_h, c1.dst_w, mid, c, ActivationKind::Identity).unwrap();
    FusedPipelineDescriptor::new(1, vec![c0, c1, c2], stride == 1).unwrap()
}

fn bench_fused_cdc(c: &mut Criterion) {
    let mut group = c.benchmark_group("cdc/fused");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    for &(size, ch, expand, stride) in BLOCKS {
        let desc = block(size, ch, expand, stride);
        let mid = ch * expand;
        let (w0, w1, w2) = (pseudo_random(ch * mid, 1), pseudo_random(9 * mid, 2), pseudo_random(mid * ch, 3));
        let mut engine = ConvEngine::new(desc.clone(), EngineConfig::default()).unwrap();
        engine
            .set_params(&[StageParams::new(&w0), StageParams::new(&w1), StageParams::new(&w2)])
            .unwrap();
        let src = pseudo_random(desc.src_size(), 4);
        let mut dst = vec![0.0f32; desc.dst_size()];
        let mut scratch = vec![0u8; engine.external_buffer_size()];
        group.throughput(Throughput::Elements(desc.dst_size() as u64));

        group.bench_with_input(
            BenchmarkId::new("block", format!("{size}x{size}x{ch}e{expand}s{stride}")),
            &desc,
            |bench, _| {
                bench.iter(|| {
                    engine.forward(black_box(&src), Some(&mut scratch[..]), &mut dst).unwrap();
                    black_box(&dst);
                });
            },
        );
    }
    group.finish();
}

fn bench_scalar_cdc(c: &mut Criterion) {
    let mut group = c.benchmark_group("cdc/scalar");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    for &(size, ch, expand, stride) in BLOCKS {
        if size > 28 {
            continue;
        }
        let mid = ch * expand;
        let s0 = ConvShape::pointwise(size, size, ch, mid);
        let s1 = ConvShape::depthwise(size, size, mid, 3, stride, 1);
        let s2 = ConvShape::pointwise(s1.dst_h(), s1.dst_w(), mid, ch);
        let (w0, w1, w2) = (pseudo_random(ch * mid, 1), pseudo_random(9 * mid, 2), pseudo_random(mid * ch, 3));
        let src = pseudo_random(size * size * ch, 4);
        group.throughput(Throughput::Elements(s2.dst_len() as u64));

        group.bench_with_input(
            BenchmarkId::new("block", format!("{size}x{size}x{ch}e{expand}s{stride}")),
            &s0,
            |bench, _| {
                bench.iter(|| {
                    let x = conv2d_nhwc(&s0, black_box(&src), &w0, &[], clamp(0.0, 6.0));
                    let x = conv2d_nhwc(&s1, &x, &w1, &[], clamp(0.0, 6.0));
                    black_box(conv2d_nhwc(&s2, &x, &w2, &[], identity));
                });
            },
        );
    }
    group.finish();
}

fn bench_dense_gemm(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm/nchw");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(3));

    for &(size, src_c, dst_c) in &[(56usize, 32usize, 64usize), (28, 64, 128), (14, 128, 256)] {
        let stage = ConvStage::builder(size, size, src_c, dst_c)
            .kernel(3, 3)
            .pad(1, 1)
            .layout(TensorLayout::Nchw)
            .activation(ActivationKind::Relu)
            .build()
            .unwrap();
        let desc = FusedPipelineDescriptor::new(1, vec![stage], false).unwrap();
        let w = pseudo_random(stage.weight_len(), 5);
        let mut engine = ConvEngine::new(desc.clone(), EngineConfig::default()).unwrap();
        engine.set_params(&[StageParams::new(&w)]).unwrap();
        let src = pseudo_random(desc.src_size(), 6);
        let mut dst = vec![0.0f32; desc.dst_size()];
        group.throughput(Throughput::Elements(desc.dst_size() as u64));

        group.bench_with_input(BenchmarkId::new("conv3x3", format!("{size}x{size}x{src_c}->{dst_c}")), &desc, |bench, _| {
            bench.iter(|| {
                engine.forward(black_box(&src), None, &mut dst).unwrap();
                black_box(&dst);
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = fused_conv_benches;
    config = Criterion::default();
    targets =
        bench_fused_cdc,
        bench_scalar_cdc,
        bench_dense_gemm,
);
criterion_main!(fused_conv_benches);
