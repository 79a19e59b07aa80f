use std::sync::Arc;

use archmage::SimdToken;
use bespoke::{CreateFlags, FormatInfo, PixelConverter};
use criterion::{BenchmarkGroup, Criterion, Throughput, measurement::WallTime};

// === SIMD tier detection ===

fn probe<T: SimdToken>() -> &'static str {
    if T::summon().is_some() {
        "available"
    } else {
        "not available"
    }
}

fn print_simd_info() {
    eprintln!("=== SIMD Tier Detection ===");
    #[cfg(target_arch = "x86_64")]
    {
        eprintln!(
            "  AVX2+FMA (x86-64-v3):    {}",
            probe::<archmage::X64V3Token>()
        );
        eprintln!(
            "  SSE2 (x86-64-v1):        {}",
            probe::<archmage::X64V1Token>()
        );
    }
    eprintln!("  Scalar:                  always available");
    eprintln!("===========================");
}

// === Benchmark helpers ===

const W: usize = 1920;
const H: usize = 1080;

fn make_src(bytes: usize) -> Vec<u8> {
    (0..bytes).map(|i| (i % 251) as u8).collect()
}

/// Benchmark one descriptor pair with the selected kernel and, when the
/// selection differs, its forced-scalar twin.
fn bench_pair(
    group: &mut BenchmarkGroup<WallTime>,
    dst_fmt: &FormatInfo,
    src_fmt: &FormatInfo,
    src_bpp: usize,
    dst_bpp: usize,
) {
    let src = make_src(W * H * src_bpp);
    let best = PixelConverter::init(dst_fmt, src_fmt, CreateFlags::default()).unwrap();

    group.bench_function("bespoke", |b| {
        let mut dst = vec![0u8; W * H * dst_bpp];
        b.iter(|| {
            best.convert(
                &mut dst,
                (W * dst_bpp) as isize,
                &src,
                (W * src_bpp) as isize,
                W,
                H,
                None,
            )
            .unwrap()
        });
    });

    if best.is_optimized() {
        let scalar = PixelConverter::init(
            dst_fmt,
            src_fmt,
            CreateFlags {
                disable_optimizations: true,
                ..CreateFlags::default()
            },
        )
        .unwrap();
        group.bench_function("bespoke_scalar", |b| {
            let mut dst = vec![0u8; W * H * dst_bpp];
            b.iter(|| {
                scalar
                    .convert(
                        &mut dst,
                        (W * dst_bpp) as isize,
                        &src,
                        (W * src_bpp) as isize,
                        W,
                        H,
                        None,
                    )
                    .unwrap()
            });
        });
    }
}

// === Benchmark groups ===

fn bench_copy_or(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_or_xrgb_to_argb");
    group.throughput(Throughput::Bytes((W * H * 4) as u64));
    bench_pair(&mut group, &FormatInfo::argb32(), &FormatInfo::xrgb32(), 4, 4);
    group.finish();
}

fn bench_shuffle(c: &mut Criterion) {
    let mut group = c.benchmark_group("shuffle_bgra_to_rgba");
    group.throughput(Throughput::Bytes((W * H * 4) as u64));
    bench_pair(&mut group, &FormatInfo::rgba32(), &FormatInfo::argb32(), 4, 4);
    group.finish();
}

fn bench_premultiply(c: &mut Criterion) {
    let mut group = c.benchmark_group("premultiply_argb");
    group.throughput(Throughput::Bytes((W * H * 4) as u64));
    bench_pair(&mut group, &FormatInfo::prgb32(), &FormatInfo::argb32(), 4, 4);
    group.finish();
}

fn bench_rgb565_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand_rgb565_to_argb");
    group.throughput(Throughput::Bytes((W * H * 4) as u64));
    bench_pair(&mut group, &FormatInfo::argb32(), &FormatInfo::rgb565(), 2, 4);
    group.finish();
}

fn bench_indexed_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand_index8_to_prgb");
    group.throughput(Throughput::Bytes((W * H * 4) as u64));
    let pal: Arc<[u32]> = (0..256u32)
        .map(|i| (i << 24) | (i << 16) | (255 - i))
        .collect::<Vec<_>>()
        .into();
    let src_fmt = FormatInfo::indexed(8, pal, true).unwrap();
    bench_pair(&mut group, &FormatInfo::prgb32(), &src_fmt, 1, 4);
    group.finish();
}

fn bench_multi_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_step_rgb24_to_rgb565");
    group.throughput(Throughput::Bytes((W * H * 3) as u64));
    bench_pair(&mut group, &FormatInfo::rgb565(), &FormatInfo::rgb24(), 3, 2);
    group.finish();
}

// === Custom main for tier detection before criterion runs ===

fn main() {
    print_simd_info();

    let mut criterion = Criterion::default().configure_from_args();
    bench_copy_or(&mut criterion);
    bench_shuffle(&mut criterion);
    bench_premultiply(&mut criterion);
    bench_rgb565_expand(&mut criterion);
    bench_indexed_expand(&mut criterion);
    bench_multi_step(&mut criterion);
    criterion.final_summary();
}
