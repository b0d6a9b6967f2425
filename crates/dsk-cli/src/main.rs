use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use dsk_core::{DType, Result, Tensor};
use dsk_kernels::dropout::{launch_dropout, launch_dropout_grad};
use dsk_kernels::elementwise::{launch_fused_add2, launch_fused_add3, launch_fused_add4};
use dsk_kernels::gelu::{launch_bias_gelu, launch_d_gelu};
use dsk_kernels::reduce::launch_fuse_transpose_bias_kernel;
use dsk_kernels::{Context, ContextConfig, CpuTimer, GpuTimer};
use dsk_ops::{FeedForward, FeedForwardConfig};

const BANNER: &str = r#"
     _     _
  __| |___| | __
 / _` / __| |/ /
| (_| \__ \   <
 \__,_|___/_|\_\"#;

#[derive(Parser)]
#[command(
    name = "dsk",
    about = "Transformer training kernels: info, benchmarks and self-checks",
    version
)]
struct Cli {
    /// JSON file with context settings (DSK_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show device, stream and RNG settings
    Info {
        /// Print the resolved context configuration as JSON
        #[arg(long)]
        json: bool,
    },
    /// Time each kernel on f16 data
    Bench {
        /// Hidden sizes to benchmark (comma-separated multiples of 4)
        #[arg(long, value_delimiter = ',', default_value = "1024,4096", value_parser = parse_hidden)]
        sizes: Vec<usize>,
        /// Rows (batch * sequence) per launch
        #[arg(long, default_value = "512")]
        rows: usize,
        /// Timed iterations per kernel
        #[arg(long, default_value = "10")]
        iters: usize,
    },
    /// Time the GEMM algorithms for a transformer layer shape and print the winners
    TuneGemm {
        #[arg(long, default_value = "1")]
        batch: usize,
        #[arg(long, default_value = "64")]
        seq_len: usize,
        #[arg(long, default_value = "4")]
        heads: usize,
        #[arg(long, default_value = "16")]
        size_per_head: usize,
    },
    /// Check the operator invariants on random data
    Selftest {
        /// Seed for the random inputs
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn parse_hidden(s: &str) -> std::result::Result<usize, String> {
    let hidden: usize = s.trim().parse().map_err(|e| format!("{s:?} is not a size: {e}"))?;
    if hidden == 0 || hidden % 4 != 0 {
        return Err(format!("hidden size {hidden} must be a positive multiple of 4"));
    }
    Ok(hidden)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let outcome = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Info { json } => cmd_info(config, json),
        Commands::Bench { sizes, rows, iters } => cmd_bench(config, &sizes, rows, iters),
        Commands::TuneGemm { batch, seq_len, heads, size_per_head } => {
            cmd_tune_gemm(config, batch, seq_len, heads, size_per_head)
        }
        Commands::Selftest { seed } => cmd_selftest(config, seed),
    });

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ContextConfig> {
    let config = match path {
        Some(path) => ContextConfig::from_json_file(path)?.with_env_overrides()?,
        None => ContextConfig::from_env()?,
    };
    tracing::debug!(?config, "context configuration");
    Ok(config)
}

fn cmd_info(config: ContextConfig, json: bool) -> Result<bool> {
    if json {
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| dsk_core::DskError::Config(e.to_string()))?;
        println!("{text}");
        return Ok(true);
    }

    let ctx = Context::new(config)?;
    let cfg = ctx.config();
    println!("{}", BANNER);
    println!("  v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    println!("\nDevice");
    println!("  Device:        {}", ctx.device());
    println!("  Compute units: {}", ctx.compute_units());
    println!("  Streams:       1 default + {} pooled", cfg.stream_pool_size);

    println!("\nRNG");
    println!("  Generator:     Philox4x32-10");
    println!("  Seed:          {}", ctx.seed());
    println!("  Deterministic: {}", if cfg.deterministic { "[x]" } else { "[ ]" });

    println!("\nDTypes");
    for dtype in [DType::F32, DType::F16, DType::BF16, DType::U8] {
        let role = if dtype.is_float() { "activations, weights" } else { "dropout masks" };
        println!("  {:<6} {}", dtype.op_suffix(), role);
    }

    println!("\nLaunch geometry");
    println!("  Threads/workgroup: {}", dsk_kernels::NUM_THREADS);
    println!("  Max workgroups:    {}", dsk_kernels::MAX_BLOCKS);
    println!("  Sub-group width:   {}", dsk_kernels::WARP_SIZE);
    Ok(true)
}

fn time_ms(ctx: &Context, iters: usize, mut f: impl FnMut() -> Result<()>) -> Result<f32> {
    f()?;
    let mut timer = GpuTimer::new(ctx.current_stream());
    timer.record();
    for _ in 0..iters {
        f()?;
    }
    Ok(timer.elapsed_ms() / iters.max(1) as f32)
}

fn cmd_bench(config: ContextConfig, sizes: &[usize], rows: usize, iters: usize) -> Result<bool> {
    let ctx = Context::new(config)?;
    let stream = ctx.current_stream();
    println!("=== dsk Kernel Benchmark (f16, {} rows) ===", rows);
    println!("Compute units: {}\n", ctx.compute_units());
    println!("{:<10} {:<22} {:>10} {:>10}", "Hidden", "Kernel", "ms", "GB/s");
    println!("{}", "-".repeat(56));

    let mut total = CpuTimer::new();
    for &hidden in sizes {
        let n = rows * hidden;
        let mut rng = StdRng::seed_from_u64(hidden as u64);
        let data = |rng: &mut StdRng| -> Vec<half::f16> {
            (0..n).map(|_| half::f16::from_f32(rng.gen_range(-1.0..1.0))).collect()
        };
        let (a, b, c, d) = (data(&mut rng), data(&mut rng), data(&mut rng), data(&mut rng));
        let bias: Vec<half::f16> = (0..hidden).map(|i| half::f16::from_f32(i as f32 * 1e-3)).collect();
        let mut out = vec![half::f16::ZERO; n];
        let mut mask = vec![0u8; n];
        let mut col = vec![half::f16::ZERO; hidden];
        let bytes = DType::F16.storage_bytes(n);

        let report = |name: &str, ms: f32, traffic: usize| {
            let gbps = traffic as f64 / (ms as f64 * 1e-3) / 1e9;
            println!("{:<10} {:<22} {:>10.3} {:>10.2}", hidden, name, ms, gbps);
        };

        let ms = time_ms(&ctx, iters, || launch_fused_add2(&stream, &mut out, &a, &b, rows, 1, hidden))?;
        report("fused_add2", ms, 3 * bytes);
        let ms = time_ms(&ctx, iters, || launch_fused_add3(&stream, &mut out, &a, &b, &c, rows, 1, hidden))?;
        report("fused_add3", ms, 4 * bytes);
        let ms = time_ms(&ctx, iters, || launch_fused_add4(&stream, &mut out, &a, &b, &c, &d, rows, 1, hidden))?;
        report("fused_add4", ms, 5 * bytes);
        let ms = time_ms(&ctx, iters, || launch_bias_gelu(&stream, &a, &bias, &mut out, hidden, rows))?;
        report("bias_gelu", ms, 2 * bytes);
        let ms = time_ms(&ctx, iters, || launch_d_gelu(&stream, &mut out, &a, &bias, hidden, rows))?;
        report("d_gelu", ms, 3 * bytes);
        let ms = time_ms(&ctx, iters, || launch_dropout(&ctx, &stream, &mut out, &a, &mut mask, n, hidden, 0.1))?;
        report("dropout", ms, 2 * bytes + n);
        let ms = time_ms(&ctx, iters, || launch_dropout_grad(&stream, &mut out, &mask, n, 0.1))?;
        report("dropout_grad", ms, 2 * bytes + n);
        let ms = time_ms(&ctx, iters, || launch_fuse_transpose_bias_kernel(&stream, &a, &mut col, rows, hidden))?;
        report("column_sum", ms, bytes);

        let ff = FeedForward::<half::f16>::new(FeedForwardConfig::new(rows, hidden, hidden));
        if rows >= hidden {
            let weights = &b[..hidden * hidden];
            let ms = time_ms(&ctx, 1, || ff.forward(&stream, rows, &a, weights, &mut out))?;
            let gflops = 2.0 * (rows * hidden * hidden) as f64 / (ms as f64 * 1e-3) / 1e9;
            println!("{:<10} {:<22} {:>10.3} {:>9.2}GF", hidden, "feedforward", ms, gflops);
        }
    }
    println!("\nTotal: {:.1} ms", total.elapsed_ms());
    Ok(true)
}

fn cmd_tune_gemm(config: ContextConfig, batch: usize, seq_len: usize, heads: usize, size_per_head: usize) -> Result<bool> {
    let ctx = Context::new(config)?;
    println!("=== GEMM tuning ===");
    println!("batch={batch} seq_len={seq_len} heads={heads} size_per_head={size_per_head}\n");

    let mut timer = CpuTimer::new();
    ctx.tune_gemm(true, batch, seq_len, heads, size_per_head)?;
    let elapsed = timer.elapsed_ms();

    let slots = ["qkv", "intermediate", "output", "attn_scores", "attn_context"];
    println!("{:<14} {:>8} {:>10} {:>10}", "Slot", "Forward", "Backward1", "Backward2");
    println!("{}", "-".repeat(46));
    for (name, algos) in slots.iter().zip(ctx.gemm_algos()) {
        println!("{:<14} {:>8} {:>10} {:>10}", name, algos[0].tag(), algos[1].tag(), algos[2].tag());
    }
    println!("\nTuned in {:.1} ms", elapsed);
    Ok(true)
}

fn random_tensor(rng: &mut StdRng, ctx: &Context, shape: &[usize]) -> Tensor {
    Tensor::uniform(rng, shape, -1.0, 1.0).to(ctx.device())
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn cmd_selftest(config: ContextConfig, seed: u64) -> Result<bool> {
    let ctx = Context::new(config)?;
    let mut rng = StdRng::seed_from_u64(seed);
    println!("=== dsk selftest (seed {seed}) ===\n");

    let mut results = Vec::new();

    // add2(B, B) == 2B
    let mut ok = true;
    for dtype in DType::FLOATS {
        let b = random_tensor(&mut rng, &ctx, &[4, 8, 64]).cast(dtype);
        let out = dsk_ops::fused_add2(&ctx, &b, &b)?;
        let doubled: Vec<f32> = b.to_f32_vec().iter().map(|x| 2.0 * x).collect();
        ok &= out.to_f32_vec() == doubled;
    }
    results.push(("add2(B, B) == 2B", ok));

    // add3(A, B, C) ~ add2(A, add2(B, C))
    let mut ok = true;
    for (dtype, tol) in [(DType::F32, 1e-6), (DType::F16, 4e-3), (DType::BF16, 3e-2)] {
        let a = random_tensor(&mut rng, &ctx, &[4, 8, 64]).cast(dtype);
        let b = random_tensor(&mut rng, &ctx, &[4, 8, 64]).cast(dtype);
        let c = random_tensor(&mut rng, &ctx, &[4, 8, 64]).cast(dtype);
        let fused = dsk_ops::fused_add3(&ctx, &a, &b, &c)?;
        let chained = dsk_ops::fused_add2(&ctx, &a, &dsk_ops::fused_add2(&ctx, &b, &c)?)?;
        ok &= max_abs_diff(&fused.to_f32_vec(), &chained.to_f32_vec()) < tol;
    }
    results.push(("add3 ~ add2(A, add2(B, C))", ok));

    // Dropout forward/backward share the mask.
    let (bsz, dim, ratio) = (64, 128, 0.1f32);
    let vals = random_tensor(&mut rng, &ctx, &[bsz, dim]);
    let (out, mask) = dsk_ops::dropout_forward(&ctx, ratio, dim, bsz, &vals)?;
    let grad = dsk_ops::dropout_backward(&ctx, ratio, dim, bsz, vals.clone(), &mask, false)?;
    let scale = 1.0 / (1.0 - ratio);
    let ok = vals
        .to_f32_vec()
        .iter()
        .zip(out.to_f32_vec())
        .zip(grad.to_f32_vec())
        .zip(mask.to_f32_vec())
        .all(|(((x, o), g), m)| {
            if m == 1.0 {
                (o - x * scale).abs() < 1e-6 && (g - x * scale).abs() < 1e-6
            } else {
                o == 0.0 && g == 0.0
            }
        });
    results.push(("dropout forward/backward mask", ok));

    // Concurrent offset reservations are disjoint.
    let before = ctx.offset();
    let mut ranges: Vec<(u64, u64)> = std::thread::scope(|s| {
        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let ctx = &ctx;
                s.spawn(move || (0..100).map(|_| (ctx.increment_offset(n).1, n)).collect::<Vec<_>>())
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap_or_default()).collect()
    });
    ranges.sort_unstable();
    let mut next = before;
    let mut ok = ranges.len() == 800 || ctx.config().deterministic;
    if !ctx.config().deterministic {
        for (start, len) in ranges {
            ok &= start == next;
            next = start + len;
        }
        ok &= next == ctx.offset();
    }
    results.push(("increment_offset ranges disjoint", ok));

    // Column sum of ones == rows.
    let (rows, cols) = (97, 70);
    let sums = dsk_ops::column_sum(&ctx, &Tensor::ones(&[rows, cols]).to(ctx.device()))?;
    results.push(("column_sum(ones) == rows", sums.to_f32_vec().iter().all(|&v| v == rows as f32)));

    // Feed-forward input gradient against a dense reference.
    let (batch, input, output) = (4, 8, 8);
    let x = random_tensor(&mut rng, &ctx, &[batch, 1, input]);
    let w = random_tensor(&mut rng, &ctx, &[output, input]);
    let dy = random_tensor(&mut rng, &ctx, &[batch, 1, output]);
    let (dx, _, _) = dsk_ops::feedforward_backward(&ctx, batch, 1, input, &dy, &x, &w)?;
    let (ws, dys) = (w.to_f32_vec(), dy.to_f32_vec());
    let reference: Vec<f32> = (0..batch * input)
        .map(|idx| {
            let (b, i) = (idx / input, idx % input);
            (0..output).map(|o| dys[b * output + o] * ws[o * input + i]).sum()
        })
        .collect();
    results.push(("feedforward grad_input", max_abs_diff(&dx.to_f32_vec(), &reference) < 1e-5));

    let mut all = true;
    for (name, ok) in &results {
        println!("  {} {}", if *ok { "[x]" } else { "[ ]" }, name);
        all &= ok;
    }
    println!("\n{}", if all { "all checks passed" } else { "FAILED" });
    Ok(all)
}
