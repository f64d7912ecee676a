use core::mem::size_of;
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cube_w4a4::kernel::layout::{
    build_a_scale_table, k_groups, scale_rows_padded, GROUP_K, KEEPER_K, PACK_I4, PACK_I8,
};
use cube_w4a4::kernel::w4a4_kernel_gemm::ShapeConfig;
use cube_w4a4::kernel::{launch_w4a4_gemm, OutputKind};
use cubecl::bytes::Bytes;
use cubecl::future;
use cubecl::prelude::*;
use cubecl::server::Handle;
use cubecl::wgpu::{WgpuDevice, WgpuRuntime};

type R = WgpuRuntime;

const TILE_M_DECODE: usize = 32;
const TILE_M_PREFILL: usize = 128;

#[derive(Clone, Copy, Debug)]
enum InferencePhase {
    Decode,
    Prefill,
}

impl InferencePhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Prefill => "prefill",
        }
    }
}

fn select_tile_n(n: usize) -> usize {
    if n >= 128 && n.is_multiple_of(128) {
        128
    } else if n >= 64 && n.is_multiple_of(64) {
        64
    } else {
        32
    }
}

fn select_stages(m_tile: usize, n_tile: usize) -> usize {
    if m_tile == 128 && n_tile == 128 {
        4
    } else {
        2
    }
}

#[derive(Clone, Copy, Debug)]
struct GemmCase {
    name: &'static str,
    phase: InferencePhase,
    m: usize,
    k_main: usize,
    n: usize,
    m_tile_size: usize,
    n_tile_size: usize,
    stages: usize,
}

impl GemmCase {
    fn llm_case(
        name: &'static str,
        phase: InferencePhase,
        m: usize,
        k_main: usize,
        n: usize,
    ) -> Self {
        let m_tile_size = match phase {
            InferencePhase::Decode => TILE_M_DECODE,
            InferencePhase::Prefill => TILE_M_PREFILL,
        };
        let n_tile_size = select_tile_n(n);
        Self {
            name,
            phase,
            m,
            k_main,
            n,
            m_tile_size,
            n_tile_size,
            stages: select_stages(m_tile_size, n_tile_size),
        }
    }

    fn shape_config(self) -> ShapeConfig {
        ShapeConfig::with_tiling(
            self.m,
            self.n,
            self.k_main + KEEPER_K,
            self.m_tile_size,
            self.n_tile_size,
            self.stages,
        )
    }

    // Keeper MMAs run at the same rate as the main phase, so the extension
    // counts toward total contraction depth.
    fn matmul_flops(self) -> u64 {
        2_u64 * self.m as u64 * self.n as u64 * (self.k_main + KEEPER_K) as u64
    }

    fn tokens_per_iter(self) -> u64 {
        self.m as u64
    }

    fn with_tiling(self, m_tile: usize, n_tile: usize, stages: usize) -> Self {
        Self {
            m_tile_size: m_tile,
            n_tile_size: n_tile,
            stages,
            ..self
        }
    }
}

#[derive(Debug)]
struct SweepRecord {
    case_name: &'static str,
    phase: &'static str,
    m: usize,
    k_main: usize,
    n: usize,
    m_tile_size: usize,
    n_tile_size: usize,
    stages: usize,
    avg_ms: f64,
    gflops: f64,
}

struct W4a4GemmBuffers {
    a: Handle,
    b: Handle,
    a_scales: Handle,
    b_scales: Handle,
    a_keeper: Handle,
    b_keeper: Handle,
    a_keeper_scale: Handle,
    b_keeper_scale: Handle,
    output: Handle,
    a_shape: [usize; 2],
    a_strides: [usize; 2],
    b_shape: [usize; 2],
    b_strides: [usize; 2],
    a_scales_shape: [usize; 2],
    a_scales_strides: [usize; 2],
    b_scales_shape: [usize; 2],
    b_scales_strides: [usize; 2],
    a_keeper_shape: [usize; 2],
    a_keeper_strides: [usize; 2],
    b_keeper_shape: [usize; 2],
    b_keeper_strides: [usize; 2],
    a_keeper_scale_shape: [usize; 1],
    a_keeper_scale_strides: [usize; 1],
    b_keeper_scale_shape: [usize; 1],
    b_keeper_scale_strides: [usize; 1],
    output_shape: [usize; 2],
    output_strides: [usize; 2],
}

fn build_packed_i4(rows: usize, k: usize, seed: usize) -> Vec<u32> {
    let words_per_row = k / PACK_I4;
    (0..rows * words_per_row)
        .map(|idx| {
            let mut word = 0_u32;
            for lane in 0..PACK_I4 {
                let nibble = ((idx * 7 + lane * 3 + seed) % 16) as u32;
                word |= nibble << (lane * 4);
            }
            word
        })
        .collect()
}

fn build_packed_i8(rows: usize, seed: usize) -> Vec<u32> {
    let words_per_row = KEEPER_K / PACK_I8;
    (0..rows * words_per_row)
        .map(|idx| {
            let mut word = 0_u32;
            for lane in 0..PACK_I8 {
                let byte = ((idx * 13 + lane * 5 + seed) % 256) as u32;
                word |= byte << (lane * 8);
            }
            word
        })
        .collect()
}

fn build_scales(count: usize, seed: usize) -> Vec<f32> {
    (0..count)
        .map(|idx| 0.01 + (((idx * 17 + seed) % 23) as f32) * 0.004)
        .collect()
}

fn prepare_buffers(client: &ComputeClient<R>, case: GemmCase) -> W4a4GemmBuffers {
    let (m, n, k_main) = (case.m, case.n, case.k_main);
    let groups = k_groups(k_main);
    let m_pad = scale_rows_padded(m);
    let words_per_row = k_main / PACK_I4;
    let keeper_words = KEEPER_K / PACK_I8;

    let a = build_packed_i4(m, k_main, 1);
    let b = build_packed_i4(n, k_main, 2);
    let a_scales = build_a_scale_table(&build_scales(groups * m, 3), m, groups);
    let b_scales = build_scales(groups * n, 4);
    let a_keeper = build_packed_i8(m, 5);
    let b_keeper = build_packed_i8(n, 6);
    let a_keeper_scale = build_scales(m, 7);
    let b_keeper_scale = build_scales(n, 8);

    W4a4GemmBuffers {
        a: client.create(Bytes::from_bytes_vec(bytemuck::cast_slice(&a).to_vec())),
        b: client.create(Bytes::from_bytes_vec(bytemuck::cast_slice(&b).to_vec())),
        a_scales: client.create(Bytes::from_bytes_vec(
            bytemuck::cast_slice(&a_scales).to_vec(),
        )),
        b_scales: client.create(Bytes::from_bytes_vec(
            bytemuck::cast_slice(&b_scales).to_vec(),
        )),
        a_keeper: client.create(Bytes::from_bytes_vec(
            bytemuck::cast_slice(&a_keeper).to_vec(),
        )),
        b_keeper: client.create(Bytes::from_bytes_vec(
            bytemuck::cast_slice(&b_keeper).to_vec(),
        )),
        a_keeper_scale: client.create(Bytes::from_bytes_vec(
            bytemuck::cast_slice(&a_keeper_scale).to_vec(),
        )),
        b_keeper_scale: client.create(Bytes::from_bytes_vec(
            bytemuck::cast_slice(&b_keeper_scale).to_vec(),
        )),
        output: client.empty(m * n * size_of::<f32>()),
        a_shape: [m, words_per_row],
        a_strides: [words_per_row, 1],
        b_shape: [n, words_per_row],
        b_strides: [words_per_row, 1],
        a_scales_shape: [groups, m_pad],
        a_scales_strides: [m_pad, 1],
        b_scales_shape: [groups, n],
        b_scales_strides: [n, 1],
        a_keeper_shape: [m, keeper_words],
        a_keeper_strides: [keeper_words, 1],
        b_keeper_shape: [n, keeper_words],
        b_keeper_strides: [keeper_words, 1],
        a_keeper_scale_shape: [m],
        a_keeper_scale_strides: [1],
        b_keeper_scale_shape: [n],
        b_keeper_scale_strides: [1],
        output_shape: [m, n],
        output_strides: [n, 1],
    }
}

fn launch_once(client: &ComputeClient<R>, shape: &ShapeConfig, buffers: &W4a4GemmBuffers) {
    let a_ref = TensorHandleRef {
        handle: &buffers.a,
        strides: &buffers.a_strides,
        shape: &buffers.a_shape,
        elem_size: size_of::<u32>(),
        runtime: PhantomData,
    };
    let b_ref = TensorHandleRef {
        handle: &buffers.b,
        strides: &buffers.b_strides,
        shape: &buffers.b_shape,
        elem_size: size_of::<u32>(),
        runtime: PhantomData,
    };
    let a_scales_ref = TensorHandleRef {
        handle: &buffers.a_scales,
        strides: &buffers.a_scales_strides,
        shape: &buffers.a_scales_shape,
        elem_size: size_of::<f32>(),
        runtime: PhantomData,
    };
    let b_scales_ref = TensorHandleRef {
        handle: &buffers.b_scales,
        strides: &buffers.b_scales_strides,
        shape: &buffers.b_scales_shape,
        elem_size: size_of::<f32>(),
        runtime: PhantomData,
    };
    let a_keeper_ref = TensorHandleRef {
        handle: &buffers.a_keeper,
        strides: &buffers.a_keeper_strides,
        shape: &buffers.a_keeper_shape,
        elem_size: size_of::<u32>(),
        runtime: PhantomData,
    };
    let b_keeper_ref = TensorHandleRef {
        handle: &buffers.b_keeper,
        strides: &buffers.b_keeper_strides,
        shape: &buffers.b_keeper_shape,
        elem_size: size_of::<u32>(),
        runtime: PhantomData,
    };
    let a_keeper_scale_ref = TensorHandleRef {
        handle: &buffers.a_keeper_scale,
        strides: &buffers.a_keeper_scale_strides,
        shape: &buffers.a_keeper_scale_shape,
        elem_size: size_of::<f32>(),
        runtime: PhantomData,
    };
    let b_keeper_scale_ref = TensorHandleRef {
        handle: &buffers.b_keeper_scale,
        strides: &buffers.b_keeper_scale_strides,
        shape: &buffers.b_keeper_scale_shape,
        elem_size: size_of::<f32>(),
        runtime: PhantomData,
    };
    let output_ref = TensorHandleRef {
        handle: &buffers.output,
        strides: &buffers.output_strides,
        shape: &buffers.output_shape,
        elem_size: size_of::<f32>(),
        runtime: PhantomData,
    };

    let launched = launch_w4a4_gemm::<R>(
        client,
        OutputKind::F32,
        &a_ref,
        &b_ref,
        &a_scales_ref,
        &b_scales_ref,
        &a_keeper_ref,
        &b_keeper_ref,
        &a_keeper_scale_ref,
        &b_keeper_scale_ref,
        &output_ref,
        shape,
    )
    .expect("W4A4 GEMM launch failed");
    assert!(launched);

    future::block_on(client.sync()).expect("W4A4 GEMM sync failed");
}

fn estimate_perf(
    case: GemmCase,
    client: &ComputeClient<R>,
    shape: &ShapeConfig,
    buffers: &W4a4GemmBuffers,
    warmup_runs: usize,
    measure_runs: usize,
) -> (f64, f64) {
    for _ in 0..warmup_runs {
        launch_once(client, shape, buffers);
    }

    let begin = Instant::now();
    for _ in 0..measure_runs {
        launch_once(client, shape, buffers);
    }

    let sec_per_run = begin.elapsed().as_secs_f64() / measure_runs as f64;
    let ms_per_run = sec_per_run * 1_000.0;
    let gflops = case.matmul_flops() as f64 / sec_per_run / 1e9;

    (ms_per_run, gflops)
}

fn parse_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_usize_list(name: &str, default: &[usize]) -> Vec<usize> {
    let Some(raw) = std::env::var(name).ok() else {
        return default.to_vec();
    };

    let parsed: Vec<usize> = raw
        .split(|ch: char| ch == ',' || ch == ';' || ch.is_whitespace())
        .filter_map(|piece| {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<usize>().ok()
        })
        .filter(|value| *value > 0)
        .collect();

    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            matches!(value.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => false,
    }
}

fn case_filter() -> Option<String> {
    std::env::var("W4A4_BENCH_CASE_FILTER")
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

fn should_run_case(filter: &Option<String>, case_name: &str) -> bool {
    match filter {
        Some(filter) => case_name.to_ascii_lowercase().contains(filter),
        None => true,
    }
}

fn is_valid_tiling(
    case: GemmCase,
    m_tile: usize,
    n_tile: usize,
    stages: usize,
    max_workgroup_units: usize,
) -> bool {
    if !matches!(m_tile, 32 | 64 | 128)
        || !matches!(n_tile, 32 | 64 | 128)
        || !matches!(stages, 2 | 4)
    {
        return false;
    }

    case.n.is_multiple_of(n_tile)
        && case.k_main.is_multiple_of(GROUP_K)
        && (m_tile / 8) * (n_tile / 8) <= max_workgroup_units
}

fn write_sweep_csv(path: &str, records: &[SweepRecord]) -> std::io::Result<()> {
    let csv_path = std::path::Path::new(path);
    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = File::create(csv_path)?;
    writeln!(
        file,
        "case,phase,m,k_main,n,m_tile_size,n_tile_size,stages,avg_ms,gflops"
    )?;

    for record in records {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{:.6},{:.6}",
            record.case_name,
            record.phase,
            record.m,
            record.k_main,
            record.n,
            record.m_tile_size,
            record.n_tile_size,
            record.stages,
            record.avg_ms,
            record.gflops,
        )?;
    }

    Ok(())
}

fn run_sweep_mode(base_cases: &[GemmCase]) {
    let m_tiles = parse_usize_list("W4A4_SWEEP_M_TILES", &[32, 64, 128]);
    let n_tiles = parse_usize_list("W4A4_SWEEP_N_TILES", &[32, 64, 128]);
    let stage_depths = parse_usize_list("W4A4_SWEEP_STAGES", &[2, 4]);

    let warmup_runs = parse_usize("W4A4_SWEEP_WARMUP", 2);
    let measure_runs = parse_usize("W4A4_SWEEP_RUNS", 6);
    let topk = parse_usize("W4A4_SWEEP_TOPK", 10);
    let max_workgroup_units = parse_usize("W4A4_SWEEP_MAX_UNITS", 256);
    let csv_path = std::env::var("W4A4_SWEEP_CSV")
        .unwrap_or_else(|_| "cube-w4a4/target/w4a4_kernel_gemm_sweep.csv".to_string());

    println!(
        "[w4a4_kernel_gemm] sweep start: warmup={}, runs={}, max_units={}, m_tiles={:?}, n_tiles={:?}, stages={:?}",
        warmup_runs, measure_runs, max_workgroup_units, m_tiles, n_tiles, stage_depths
    );

    let device = WgpuDevice::default();
    let client = R::client(&device);

    let mut records = Vec::<SweepRecord>::new();

    for base in base_cases {
        println!(
            "[w4a4_kernel_gemm] sweep case={} (M={}, K={}, N={})",
            base.name, base.m, base.k_main, base.n
        );

        for &m_tile in &m_tiles {
            for &n_tile in &n_tiles {
                for &stages in &stage_depths {
                    if !is_valid_tiling(*base, m_tile, n_tile, stages, max_workgroup_units) {
                        continue;
                    }

                    let case = base.with_tiling(m_tile, n_tile, stages);
                    let shape = case.shape_config();
                    let buffers = prepare_buffers(&client, case);
                    let (avg_ms, gflops) =
                        estimate_perf(case, &client, &shape, &buffers, warmup_runs, measure_runs);

                    println!(
                        "  - mt={} nt={} st={} => {:.3} ms, {:.2} GFLOPS",
                        m_tile, n_tile, stages, avg_ms, gflops
                    );

                    records.push(SweepRecord {
                        case_name: case.name,
                        phase: case.phase.as_str(),
                        m: case.m,
                        k_main: case.k_main,
                        n: case.n,
                        m_tile_size: m_tile,
                        n_tile_size: n_tile,
                        stages,
                        avg_ms,
                        gflops,
                    });
                }
            }
        }
    }

    if records.is_empty() {
        println!("[w4a4_kernel_gemm] no valid sweep config found.");
        return;
    }

    records.sort_by(|lhs, rhs| rhs.gflops.total_cmp(&lhs.gflops));

    println!("[w4a4_kernel_gemm] top-{} configs:", topk.min(records.len()));
    for (idx, record) in records.iter().take(topk).enumerate() {
        println!(
            "  #{:02} {} mt={} nt={} st={} => {:.3} ms, {:.2} GFLOPS",
            idx + 1,
            record.case_name,
            record.m_tile_size,
            record.n_tile_size,
            record.stages,
            record.avg_ms,
            record.gflops
        );
    }

    match write_sweep_csv(&csv_path, &records) {
        Ok(()) => println!("[w4a4_kernel_gemm] wrote sweep csv: {}", csv_path),
        Err(err) => println!(
            "[w4a4_kernel_gemm] failed to write csv {}: {}",
            csv_path, err
        ),
    }
}

fn bench_cases() -> Vec<GemmCase> {
    let mut cases = vec![
        // Decode (single-token, latency-oriented)
        GemmCase::llm_case("decode_qkv_b1", InferencePhase::Decode, 1, 896, 896),
        GemmCase::llm_case("decode_o_proj_b1", InferencePhase::Decode, 1, 896, 896),
        GemmCase::llm_case("decode_mlp_up_b1", InferencePhase::Decode, 1, 896, 4864),
        GemmCase::llm_case("decode_mlp_down_b1", InferencePhase::Decode, 1, 4864, 896),
        // Prefill (longer sequence, throughput-oriented)
        GemmCase::llm_case("prefill_qkv_s128", InferencePhase::Prefill, 128, 896, 896),
        GemmCase::llm_case("prefill_o_proj_s128", InferencePhase::Prefill, 128, 896, 896),
        GemmCase::llm_case("prefill_mlp_up_s128", InferencePhase::Prefill, 128, 896, 4864),
        GemmCase::llm_case("prefill_mlp_down_s128", InferencePhase::Prefill, 128, 4864, 896),
    ];

    // Set W4A4_BENCH_FULL=1 for heavier decode batching and long-context prefill.
    if env_flag("W4A4_BENCH_FULL") {
        cases.push(GemmCase::llm_case(
            "decode_mlp_up_b8",
            InferencePhase::Decode,
            8,
            896,
            4864,
        ));
        cases.push(GemmCase::llm_case(
            "prefill_mlp_up_s512",
            InferencePhase::Prefill,
            512,
            896,
            4864,
        ));
        cases.push(GemmCase::llm_case(
            "prefill_mlp_down_s512",
            InferencePhase::Prefill,
            512,
            4864,
            896,
        ));
    }

    cases
}

fn bench_w4a4_kernel_gemm(c: &mut Criterion) {
    let filter = case_filter();
    let cases: Vec<GemmCase> = bench_cases()
        .into_iter()
        .filter(|case| should_run_case(&filter, case.name))
        .collect();

    if let Some(filter) = &filter {
        println!("[w4a4_kernel_gemm] case filter: {}", filter);
    }
    if cases.is_empty() {
        println!("[w4a4_kernel_gemm] no case matched filter.");
        return;
    }

    if env_flag("W4A4_BENCH_SWEEP") {
        run_sweep_mode(&cases);
        return;
    }

    let mut group = c.benchmark_group("w4a4_kernel_gemm");
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));

    for case in cases {
        let device = WgpuDevice::default();
        let client = R::client(&device);
        let shape = case.shape_config();
        let buffers = prepare_buffers(&client, case);

        let (avg_ms, est_gflops) = estimate_perf(case, &client, &shape, &buffers, 3, 10);
        let tokens_per_sec = case.tokens_per_iter() as f64 / (avg_ms / 1_000.0);
        let ms_per_token = avg_ms / case.tokens_per_iter() as f64;
        println!(
            "[w4a4_kernel_gemm] {} ({}) estimate: {:.3} ms, {:.3} ms/token, {:.1} tok/s, {:.2} GFLOPS",
            case.name,
            case.phase.as_str(),
            avg_ms,
            ms_per_token,
            tokens_per_sec,
            est_gflops
        );

        // Use one element as one token so throughput is interpreted as token/s.
        group.throughput(Throughput::Elements(case.tokens_per_iter()));
        group.bench_with_input(
            BenchmarkId::new(case.phase.as_str(), case.name),
            &case,
            |b, _| {
                b.iter(|| {
                    launch_once(&client, &shape, &buffers);
                    black_box(&buffers.output);
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_w4a4_kernel_gemm);
criterion_main!(benches);
