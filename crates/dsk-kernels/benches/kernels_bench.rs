//! Benchmark: dsk-kernels elementwise, dropout, reduction and GEMM throughput.

use dsk_kernels::blas::{gemm_ex, GemmAlgo, Transpose};
use dsk_kernels::dropout::launch_dropout;
use dsk_kernels::elementwise::launch_fused_add2;
use dsk_kernels::gelu::launch_bias_gelu;
use dsk_kernels::reduce::launch_fuse_transpose_bias_kernel;
use dsk_kernels::{Context, ContextConfig, GpuTimer};
use half::f16;

fn time_ms<F: FnMut()>(ctx: &Context, iters: usize, mut f: F) -> f32 {
    f();
    let mut timer = GpuTimer::new(ctx.current_stream());
    timer.record();
    for _ in 0..iters {
        f();
    }
    timer.elapsed_ms() / iters as f32
}

fn gbps(bytes: usize, ms: f32) -> f64 {
    bytes as f64 / (ms as f64 * 1e-3) / 1e9
}

fn gflops(m: usize, n: usize, k: usize, ms: f32) -> f64 {
    (2.0 * m as f64 * n as f64 * k as f64) / (ms as f64 * 1e-3) / 1e9
}

fn main() {
    let ctx = match Context::new(ContextConfig::default()) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("failed to create context: {e}");
            std::process::exit(1);
        }
    };
    let stream = ctx.current_stream();
    println!("=== dsk Kernel Benchmark ===");
    println!("workers: {}\n", ctx.compute_units());

    println!("{:<28} {:>10} {:>10} {:>12}", "Kernel", "Elems", "ms", "GB/s");
    println!("{}", "-".repeat(64));
    for &(rows, hidden) in &[(512usize, 1024usize), (2048, 1024), (4096, 4096)] {
        let n = rows * hidden;
        let a: Vec<f16> = (0..n).map(|i| f16::from_f32((i % 13) as f32 * 0.1)).collect();
        let b = a.clone();
        let bias = vec![f16::from_f32(0.1); hidden];
        let mut out = vec![f16::ZERO; n];
        let mut mask = vec![0u8; n];
        let bytes = n * 2;

        let ms = time_ms(&ctx, 10, || {
            let _ = launch_fused_add2(&stream, &mut out, &a, &b, rows, 1, hidden);
        });
        println!("{:<28} {:>10} {:>10.3} {:>12.2}", "fused_add2 (f16)", n, ms, gbps(3 * bytes, ms));

        let ms = time_ms(&ctx, 10, || {
            let _ = launch_bias_gelu(&stream, &a, &bias, &mut out, hidden, rows);
        });
        println!("{:<28} {:>10} {:>10.3} {:>12.2}", "bias_gelu (f16)", n, ms, gbps(2 * bytes, ms));

        let ms = time_ms(&ctx, 10, || {
            let _ = launch_dropout(&ctx, &stream, &mut out, &a, &mut mask, n, hidden, 0.1);
        });
        println!("{:<28} {:>10} {:>10.3} {:>12.2}", "dropout (f16)", n, ms, gbps(2 * bytes + n, ms));

        let mut col = vec![f16::ZERO; hidden];
        let ms = time_ms(&ctx, 10, || {
            let _ = launch_fuse_transpose_bias_kernel(&stream, &a, &mut col, rows, hidden);
        });
        println!("{:<28} {:>10} {:>10.3} {:>12.2}", "column_sum (f16)", n, ms, gbps(bytes, ms));
    }

    println!("\n{:<20} {:>10} {:>12} {:>10} {:>12}", "GEMM (T,N)", "Ref ms", "Ref GF/s", "Blk ms", "Blk GF/s");
    println!("{}", "-".repeat(68));
    for &(m, n, k) in &[(128usize, 128usize, 128usize), (256, 256, 256), (512, 512, 512)] {
        let a: Vec<f32> = (0..m * k).map(|i| ((i * 7 + 3) % 13) as f32 * 0.1 - 0.6).collect();
        let b: Vec<f32> = (0..k * n).map(|i| ((i * 11 + 5) % 17) as f32 * 0.1 - 0.8).collect();
        let mut c = vec![0.0f32; m * n];
        let mut run = |algo| {
            time_ms(&ctx, 3, || {
                let _ = gemm_ex(&stream, Transpose::Trans, Transpose::NoTrans, m, n, k, 1.0, 0.0, &a, &b, &mut c, algo);
            })
        };
        let reference = run(GemmAlgo::Reference);
        let blocked = run(GemmAlgo::Blocked);
        println!(
            "{:<20} {:>10.3} {:>12.2} {:>10.3} {:>12.2}",
            format!("{m}x{n}x{k}"),
            reference,
            gflops(m, n, k, reference),
            blocked,
            gflops(m, n, k, blocked)
        );
    }
}
