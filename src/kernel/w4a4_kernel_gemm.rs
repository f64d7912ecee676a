use cubecl::prelude::*;
use cubecl::{
    calculate_cube_count_elemwise,
    std::tensor::layout::linear::{linear_view, LinearView},
};

use crate::kernel::layout::{
    scale_perm, scale_rows_padded, swizzled_chunk_col, CHUNK_U32, GROUP_K, I4_CHUNKS_PER_ROW,
    I4_PER_CHUNK, I8_CHUNKS_PER_ROW, KEEPER_K, PACK_I8, SCALE_SPAN,
};

// Per-unit register tile: 8x8 outputs, so a 128x128 cube tile is covered by
// 256 units (the 4x2 arrangement of eight 32-lane groups).
const ROWS_PER_UNIT: usize = 8;
const COLS_PER_UNIT: usize = 8;
const ACC_LEN: usize = ROWS_PER_UNIT * COLS_PER_UNIT;

// Depth-64 int4 MMA issues per K-group, two 16-byte fragments each.
const I4_MMA_STEPS: usize = GROUP_K / I4_PER_CHUNK / 2;
// Depth-32 int8 MMA issues over the keeper extension, same fragment shape.
const I8_MMA_STEPS: usize = I8_CHUNKS_PER_ROW / 2;

// Row chunk staged through the scratchpad per epilogue round. Output lines
// are 4 elements wide, so f32 launches write full 16-byte chunks while f16
// launches write 8-byte halves.
const OUT_STAGE_ROWS: usize = 16;

/// Production geometry: one cube produces a 128x128 output tile over a
/// four-deep copy pipeline.
pub const TILE_DEFAULT: usize = 128;
pub const STAGES_DEFAULT: usize = 4;

/// Per-cube scratchpad budget the validated configurations must fit in.
pub const SCRATCHPAD_LIMIT_BYTES: usize = 96 * 1024;

// A: (M, K) int4 row-major, packed 8/u32
// B: (N, K) int4 row-major (the weight matrix stored transposed), packed 8/u32
// D: (M, N)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeConfig {
    m: usize,
    n: usize,
    k_main: usize, // contraction depth excluding the keeper extension
    tile_m: usize, // 32|64|128
    tile_n: usize, // 32|64|128
    stages: usize, // 2|4
    m_valid: usize,
}

impl ShapeConfig {
    /// `k_total` includes the keeper width; the kernel consumes the keeper
    /// extension separately, so it is subtracted here.
    pub fn new(m: usize, n: usize, k_total: usize) -> Self {
        Self::with_tiling(m, n, k_total, TILE_DEFAULT, TILE_DEFAULT, STAGES_DEFAULT)
    }

    pub fn with_tiling(
        m: usize,
        n: usize,
        k_total: usize,
        tile_m: usize,
        tile_n: usize,
        stages: usize,
    ) -> Self {
        Self::with_tiling_and_valid_m(m, n, k_total, tile_m, tile_n, stages, m)
    }

    pub fn with_tiling_and_valid_m(
        m: usize,
        n: usize,
        k_total: usize,
        tile_m: usize,
        tile_n: usize,
        stages: usize,
        m_valid: usize,
    ) -> Self {
        assert!(
            k_total > KEEPER_K,
            "k_total includes the {KEEPER_K}-deep keeper extension"
        );
        Self {
            m,
            n,
            k_main: k_total - KEEPER_K,
            tile_m,
            tile_n,
            stages,
            m_valid,
        }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k_main(&self) -> usize {
        self.k_main
    }

    pub fn groups(&self) -> usize {
        self.k_main.div_ceil(GROUP_K)
    }
}

pub(crate) fn validate_launch_params(shape: &ShapeConfig, elem_bytes: usize) {
    assert!(shape.m > 0, "m must be > 0");
    assert!(shape.n > 0, "n must be > 0");
    assert!(shape.k_main > 0, "k_main must be > 0");
    assert!(
        shape.k_main.is_multiple_of(I4_PER_CHUNK),
        "k_main must be divisible by the 16-byte chunk width"
    );

    // Tile loop safety. N carries no tail guard, so it must be tile-aligned.
    assert!(
        matches!(shape.tile_m, 32 | 64 | 128),
        "tile_m must be 32, 64 or 128"
    );
    assert!(
        matches!(shape.tile_n, 32 | 64 | 128),
        "tile_n must be 32, 64 or 128"
    );
    assert!(
        shape.n.is_multiple_of(shape.tile_n),
        "n must be divisible by tile_n"
    );
    assert!(shape.m_valid <= shape.m, "m_valid must be <= m");

    // Ring and keeper staging safety: the keeper tile reuses the operand ring
    // with 8-chunk rows, which needs at least two 4-chunk stages.
    assert!(
        matches!(shape.stages, 2 | 4),
        "pipeline depth must be 2 or 4"
    );
    assert!(
        shape.tile_m.is_multiple_of(OUT_STAGE_ROWS),
        "tile_m must be divisible by the epilogue row chunk"
    );

    let bytes = crate::kernel::layout::scratchpad_bytes(
        shape.tile_m,
        shape.tile_n,
        shape.stages,
        elem_bytes,
        elem_bytes,
    );
    assert!(
        bytes <= SCRATCHPAD_LIMIT_BYTES,
        "scratchpad footprint {bytes} exceeds the {SCRATCHPAD_LIMIT_BYTES} byte budget"
    );
}

// One depth-64 low-bit MMA issue: two 16-byte fragments per operand,
// accumulating 64 nibble products into i32.
#[cube]
fn mma_i4(a_lo: Line<u32>, a_hi: Line<u32>, b_lo: Line<u32>, b_hi: Line<u32>) -> i32 {
    let mut acc = 0i32;
    #[unroll]
    for j in 0..CHUNK_U32 {
        acc += dot_i4_word(a_lo[j], b_lo[j]);
        acc += dot_i4_word(a_hi[j], b_hi[j]);
    }
    acc
}

// One depth-32 high-bit MMA issue over the same fragment shape.
#[cube]
fn mma_i8(a_lo: Line<u32>, a_hi: Line<u32>, b_lo: Line<u32>, b_hi: Line<u32>) -> i32 {
    let mut acc = 0i32;
    #[unroll]
    for j in 0..CHUNK_U32 {
        acc += dot_i8_word(a_lo[j], b_lo[j]);
        acc += dot_i8_word(a_hi[j], b_hi[j]);
    }
    acc
}

#[cube]
fn dot_i4_word(a: u32, b: u32) -> i32 {
    let mut acc = 0i32;
    #[unroll]
    for lane in 0..8usize {
        let shift = lane * 4;
        let av = (i32::cast_from((a >> shift) & 0xF) ^ 8) - 8;
        let bv = (i32::cast_from((b >> shift) & 0xF) ^ 8) - 8;
        acc += av * bv;
    }
    acc
}

#[cube]
fn dot_i8_word(a: u32, b: u32) -> i32 {
    let mut acc = 0i32;
    #[unroll]
    for lane in 0..PACK_I8 {
        let shift = lane * 8;
        let av = (i32::cast_from((a >> shift) & 0xFF) ^ 0x80) - 0x80;
        let bv = (i32::cast_from((b >> shift) & 0xFF) ^ 0x80) - 0x80;
        acc += av * bv;
    }
    acc
}

// Fused W4A4 GEMM with int8 keeper refinement.
//
// Structure:
//   1. Ring of `stages` scratchpad slots; the loader runs `stages - 1` tiles
//      ahead of compute, one sync_cube() per K-tile is the completion fence.
//   2. Operand chunks land at a swizzled column (same pure function on the
//      read side) so cooperative loads and fragment extraction stay
//      conflict-free.
//   3. Each K-tile is one quantization group: integer MMA issues accumulate
//      into i32, then the paired group scales are widened and folded into the
//      f32 running sum, and the i32 accumulator is reset for the next group.
//   4. The keeper extension re-enters the same scratchpad and extraction path
//      with 8-chunk int8 rows and the high-bit MMA variant.
//   5. The epilogue stages 16-row chunks through shared memory so the final
//      writes are whole 16-byte lines, skipping rows past m_valid.
#[cube(launch)]
pub fn w4a4_gemm<F: Float>(
    a: &LinearView<Line<u32>>,
    b: &LinearView<Line<u32>>,
    a_scales: &LinearView<Line<F>>,
    b_scales: &LinearView<Line<F>>,
    a_keeper: &LinearView<Line<u32>>,
    b_keeper: &LinearView<Line<u32>>,
    a_keeper_scale: &LinearView<F>,
    b_keeper_scale: &LinearView<F>,
    out: &mut LinearView<Line<F>, ReadWrite>,
    #[comptime] shape: &ShapeConfig,
) {
    let k_chunks_total = (shape.k_main + I4_PER_CHUNK - 1) / I4_PER_CHUNK;
    let k_tiles = (shape.k_main + GROUP_K - 1) / GROUP_K;
    let m_pad = (shape.m + SCALE_SPAN - 1) / SCALE_SPAN * SCALE_SPAN;

    let a_stage_chunks = shape.tile_m * I4_CHUNKS_PER_ROW;
    let b_stage_chunks = shape.tile_n * I4_CHUNKS_PER_ROW;
    let a_scale_lines = shape.tile_m / 2;
    let b_scale_lines = shape.tile_n / 2;

    let units_x = shape.tile_n / COLS_PER_UNIT;
    let units_y = shape.tile_m / ROWS_PER_UNIT;
    let total_units = units_x * units_y;
    let half_units = total_units / 2;

    let out_lines_per_row = shape.tile_n / CHUNK_U32;

    // Operand staging ring (16-byte chunks) plus flat scale slices per stage.
    let mut sm_a = SharedMemory::<u32>::new_lined(shape.stages * a_stage_chunks, CHUNK_U32);
    let mut sm_b = SharedMemory::<u32>::new_lined(shape.stages * b_stage_chunks, CHUNK_U32);
    let mut sm_scale_a = SharedMemory::<F>::new(shape.stages * shape.tile_m);
    let mut sm_scale_b = SharedMemory::<F>::new(shape.stages * shape.tile_n);
    // Epilogue staging, reusing the scratchpad budget after the ring retires.
    let mut sm_out = SharedMemory::<F>::new_lined(OUT_STAGE_ROWS * out_lines_per_row, CHUNK_U32);

    // Tile origin.
    let mc = (CUBE_POS / (shape.n / shape.tile_n)) * shape.tile_m;
    let nc = (CUBE_POS % (shape.n / shape.tile_n)) * shape.tile_n;

    let unit_pos = UNIT_POS as usize;
    let row0 = (unit_pos / units_x) * ROWS_PER_UNIT;
    let col0 = (unit_pos % units_x) * COLS_PER_UNIT;

    let mut acc_int = Array::<i32>::new(ACC_LEN);
    let mut acc_fp = Array::<f32>::new(ACC_LEN);
    #[unroll]
    for i in 0..ACC_LEN {
        acc_int[i] = 0;
        acc_fp[i] = 0.0;
    }

    // ===================================================================
    // Prologue: the loader fills stages 0..stages-1, running depth-1 tiles
    // ahead before compute consumes anything.
    // ===================================================================
    for stage in 0..(shape.stages - 1) {
        if stage < k_tiles {
            let a_base = stage * a_stage_chunks;
            let mut t = unit_pos;
            while t < a_stage_chunks {
                let r = t / I4_CHUNKS_PER_ROW;
                let lc = t % I4_CHUNKS_PER_ROW;
                let dst = a_base
                    + r * I4_CHUNKS_PER_ROW
                    + swizzled_chunk_col(r, lc, I4_CHUNKS_PER_ROW);
                let gk = stage * I4_CHUNKS_PER_ROW + lc;
                if (mc + r) < shape.m_valid && gk < k_chunks_total {
                    sm_a[dst] = a[(mc + r) * k_chunks_total + gk];
                } else {
                    sm_a[dst] = Line::<u32>::empty(CHUNK_U32).fill(0u32);
                }
                t += total_units;
            }

            let b_base = stage * b_stage_chunks;
            let mut w = unit_pos;
            while w < b_stage_chunks {
                let r = w / I4_CHUNKS_PER_ROW;
                let lc = w % I4_CHUNKS_PER_ROW;
                let dst = b_base
                    + r * I4_CHUNKS_PER_ROW
                    + swizzled_chunk_col(r, lc, I4_CHUNKS_PER_ROW);
                let gk = stage * I4_CHUNKS_PER_ROW + lc;
                if gk < k_chunks_total {
                    sm_b[dst] = b[(nc + r) * k_chunks_total + gk];
                } else {
                    sm_b[dst] = Line::<u32>::empty(CHUNK_U32).fill(0u32);
                }
                w += total_units;
            }

            // Scale slices: disjoint unit ranges serve the A and B tables.
            if unit_pos < half_units {
                let mut t = unit_pos;
                while t < a_scale_lines {
                    let span = (t * 2) & (!(SCALE_SPAN as u32 - 1) as usize);
                    let dst = stage * shape.tile_m + t * 2;
                    if (mc + span) < shape.m_valid {
                        let pair = a_scales[stage * (m_pad / 2) + mc / 2 + t];
                        sm_scale_a[dst] = pair[0];
                        sm_scale_a[dst + 1] = pair[1];
                    } else {
                        sm_scale_a[dst] = F::cast_from(0);
                        sm_scale_a[dst + 1] = F::cast_from(0);
                    }
                    t += half_units;
                }
            } else {
                let mut t = unit_pos - half_units;
                while t < b_scale_lines {
                    let pair = b_scales[stage * (shape.n / 2) + nc / 2 + t];
                    let dst = stage * shape.tile_n + t * 2;
                    sm_scale_b[dst] = pair[0];
                    sm_scale_b[dst + 1] = pair[1];
                    t += total_units - half_units;
                }
            }
        }
    }
    sync_cube();

    // ===================================================================
    // Main loop: one K-tile (= one quantization group) per iteration.
    // ===================================================================
    for kt in 0..k_tiles {
        let stage = kt % shape.stages;
        let next_kt = kt + shape.stages - 1;
        let has_next = next_kt < k_tiles;

        // Producer: land K-tile kt+depth-1 into the slot retired last round.
        if has_next {
            let next_stage = next_kt % shape.stages;

            let a_base = next_stage * a_stage_chunks;
            let mut t = unit_pos;
            while t < a_stage_chunks {
                let r = t / I4_CHUNKS_PER_ROW;
                let lc = t % I4_CHUNKS_PER_ROW;
                let dst = a_base
                    + r * I4_CHUNKS_PER_ROW
                    + swizzled_chunk_col(r, lc, I4_CHUNKS_PER_ROW);
                let gk = next_kt * I4_CHUNKS_PER_ROW + lc;
                if (mc + r) < shape.m_valid && gk < k_chunks_total {
                    sm_a[dst] = a[(mc + r) * k_chunks_total + gk];
                } else {
                    sm_a[dst] = Line::<u32>::empty(CHUNK_U32).fill(0u32);
                }
                t += total_units;
            }

            let b_base = next_stage * b_stage_chunks;
            let mut w = unit_pos;
            while w < b_stage_chunks {
                let r = w / I4_CHUNKS_PER_ROW;
                let lc = w % I4_CHUNKS_PER_ROW;
                let dst = b_base
                    + r * I4_CHUNKS_PER_ROW
                    + swizzled_chunk_col(r, lc, I4_CHUNKS_PER_ROW);
                let gk = next_kt * I4_CHUNKS_PER_ROW + lc;
                if gk < k_chunks_total {
                    sm_b[dst] = b[(nc + r) * k_chunks_total + gk];
                } else {
                    sm_b[dst] = Line::<u32>::empty(CHUNK_U32).fill(0u32);
                }
                w += total_units;
            }

            if unit_pos < half_units {
                let mut t = unit_pos;
                while t < a_scale_lines {
                    let span = (t * 2) & (!(SCALE_SPAN as u32 - 1) as usize);
                    let dst = next_stage * shape.tile_m + t * 2;
                    if (mc + span) < shape.m_valid {
                        let pair = a_scales[next_kt * (m_pad / 2) + mc / 2 + t];
                        sm_scale_a[dst] = pair[0];
                        sm_scale_a[dst + 1] = pair[1];
                    } else {
                        sm_scale_a[dst] = F::cast_from(0);
                        sm_scale_a[dst + 1] = F::cast_from(0);
                    }
                    t += half_units;
                }
            } else {
                let mut t = unit_pos - half_units;
                while t < b_scale_lines {
                    let pair = b_scales[next_kt * (shape.n / 2) + nc / 2 + t];
                    let dst = next_stage * shape.tile_n + t * 2;
                    sm_scale_b[dst] = pair[0];
                    sm_scale_b[dst + 1] = pair[1];
                    t += total_units - half_units;
                }
            }
        }

        // -------------------------
        // Consumer: fragment extraction + low-bit MMA on the current stage.
        // -------------------------
        let a_base = stage * a_stage_chunks;
        let b_base = stage * b_stage_chunks;
        #[unroll]
        for step in 0..I4_MMA_STEPS {
            #[unroll]
            for r in 0..ROWS_PER_UNIT {
                let ar = row0 + r;
                let a_lo = sm_a[a_base
                    + ar * I4_CHUNKS_PER_ROW
                    + swizzled_chunk_col(ar, step * 2, I4_CHUNKS_PER_ROW)];
                let a_hi = sm_a[a_base
                    + ar * I4_CHUNKS_PER_ROW
                    + swizzled_chunk_col(ar, step * 2 + 1, I4_CHUNKS_PER_ROW)];
                #[unroll]
                for c in 0..COLS_PER_UNIT {
                    let bc = col0 + c;
                    let b_lo = sm_b[b_base
                        + bc * I4_CHUNKS_PER_ROW
                        + swizzled_chunk_col(bc, step * 2, I4_CHUNKS_PER_ROW)];
                    let b_hi = sm_b[b_base
                        + bc * I4_CHUNKS_PER_ROW
                        + swizzled_chunk_col(bc, step * 2 + 1, I4_CHUNKS_PER_ROW)];
                    acc_int[r * COLS_PER_UNIT + c] += mma_i4(a_lo, a_hi, b_lo, b_hi);
                }
            }
        }

        // Group boundary: widen the paired scales, fold the integer partial
        // into the running f32 sum, then reset the integer accumulator.
        #[unroll]
        for r in 0..ROWS_PER_UNIT {
            let ar = row0 + r;
            let sa = sm_scale_a[stage * shape.tile_m + scale_perm(ar)];
            #[unroll]
            for c in 0..COLS_PER_UNIT {
                let sb = sm_scale_b[stage * shape.tile_n + col0 + c];
                let combined = f32::cast_from(sa * sb);
                let idx = r * COLS_PER_UNIT + c;
                acc_fp[idx] += combined * f32::cast_from(acc_int[idx]);
                acc_int[idx] = 0;
            }
        }

        // Publish the freshly landed stage; retire the consumed one.
        sync_cube();
    }

    // ===================================================================
    // Keeper phase: the 128-deep int8 extension flows through the same ring
    // and extraction path, with 8-chunk rows and the high-bit MMA.
    // ===================================================================
    let a_keep_chunks = shape.tile_m * I8_CHUNKS_PER_ROW;
    let mut t = unit_pos;
    while t < a_keep_chunks {
        let r = t / I8_CHUNKS_PER_ROW;
        let lc = t % I8_CHUNKS_PER_ROW;
        let dst = r * I8_CHUNKS_PER_ROW + swizzled_chunk_col(r, lc, I8_CHUNKS_PER_ROW);
        if (mc + r) < shape.m_valid {
            sm_a[dst] = a_keeper[(mc + r) * I8_CHUNKS_PER_ROW + lc];
        } else {
            sm_a[dst] = Line::<u32>::empty(CHUNK_U32).fill(0u32);
        }
        t += total_units;
    }
    let b_keep_chunks = shape.tile_n * I8_CHUNKS_PER_ROW;
    let mut w = unit_pos;
    while w < b_keep_chunks {
        let r = w / I8_CHUNKS_PER_ROW;
        let lc = w % I8_CHUNKS_PER_ROW;
        let dst = r * I8_CHUNKS_PER_ROW + swizzled_chunk_col(r, lc, I8_CHUNKS_PER_ROW);
        sm_b[dst] = b_keeper[(nc + r) * I8_CHUNKS_PER_ROW + lc];
        w += total_units;
    }
    sync_cube();

    #[unroll]
    for step in 0..I8_MMA_STEPS {
        #[unroll]
        for r in 0..ROWS_PER_UNIT {
            let ar = row0 + r;
            let a_lo = sm_a[ar * I8_CHUNKS_PER_ROW
                + swizzled_chunk_col(ar, step * 2, I8_CHUNKS_PER_ROW)];
            let a_hi = sm_a[ar * I8_CHUNKS_PER_ROW
                + swizzled_chunk_col(ar, step * 2 + 1, I8_CHUNKS_PER_ROW)];
            #[unroll]
            for c in 0..COLS_PER_UNIT {
                let bc = col0 + c;
                let b_lo = sm_b[bc * I8_CHUNKS_PER_ROW
                    + swizzled_chunk_col(bc, step * 2, I8_CHUNKS_PER_ROW)];
                let b_hi = sm_b[bc * I8_CHUNKS_PER_ROW
                    + swizzled_chunk_col(bc, step * 2 + 1, I8_CHUNKS_PER_ROW)];
                acc_int[r * COLS_PER_UNIT + c] += mma_i8(a_lo, a_hi, b_lo, b_hi);
            }
        }
    }

    // Keeper fold: one scale pair per (row, column), read straight from
    // device memory. Rows past m_valid are skipped so no out-of-range scale
    // is ever read; their accumulators are never written back.
    #[unroll]
    for r in 0..ROWS_PER_UNIT {
        let grow = mc + row0 + r;
        if grow < shape.m_valid {
            let sa = a_keeper_scale[grow];
            #[unroll]
            for c in 0..COLS_PER_UNIT {
                let sb = b_keeper_scale[nc + col0 + c];
                let idx = r * COLS_PER_UNIT + c;
                acc_fp[idx] += f32::cast_from(sa * sb) * f32::cast_from(acc_int[idx]);
                acc_int[idx] = 0;
            }
        }
    }

    // ===================================================================
    // Epilogue: stage 16-row chunks through the scratchpad so device writes
    // are whole 16-byte lines, with the M-row tail guard.
    // ===================================================================
    let out_chunks = shape.tile_m / OUT_STAGE_ROWS;
    for chunk in 0..out_chunks {
        let row_base = chunk * OUT_STAGE_ROWS;
        // Unit row blocks never straddle a 16-row chunk.
        if row0 >= row_base && row0 < row_base + OUT_STAGE_ROWS {
            #[unroll]
            for r in 0..ROWS_PER_UNIT {
                let local_r = row0 - row_base + r;
                #[unroll]
                for lc in 0..(COLS_PER_UNIT / CHUNK_U32) {
                    let mut line = Line::<F>::empty(CHUNK_U32);
                    #[unroll]
                    for j in 0..CHUNK_U32 {
                        line[j] = F::cast_from(acc_fp[r * COLS_PER_UNIT + lc * CHUNK_U32 + j]);
                    }
                    sm_out[local_r * out_lines_per_row + col0 / CHUNK_U32 + lc] = line;
                }
            }
        }
        sync_cube();

        let chunk_lines = OUT_STAGE_ROWS * out_lines_per_row;
        let mut t = unit_pos;
        while t < chunk_lines {
            let r = t / out_lines_per_row;
            let lc = t % out_lines_per_row;
            let grow = mc + row_base + r;
            if grow < shape.m_valid {
                out[(grow * shape.n + nc) / CHUNK_U32 + lc] = sm_out[t];
            }
            t += total_units;
        }
        sync_cube();
    }
}

/// Launches the fused kernel over raw tensor handles. All operand handles are
/// packed `u32` words; scale handles carry the launch float type `F`.
#[allow(clippy::too_many_arguments)]
pub fn w4a4_gemm_launch<R: Runtime, F: Float>(
    client: &ComputeClient<R>,
    a: &TensorHandleRef<R>,
    b: &TensorHandleRef<R>,
    a_scales: &TensorHandleRef<R>,
    b_scales: &TensorHandleRef<R>,
    a_keeper: &TensorHandleRef<R>,
    b_keeper: &TensorHandleRef<R>,
    a_keeper_scale: &TensorHandleRef<R>,
    b_keeper_scale: &TensorHandleRef<R>,
    output: &TensorHandleRef<R>,
    shape: &ShapeConfig,
) -> Result<(), LaunchError> {
    let elem = core::mem::size_of::<F>();
    validate_launch_params(shape, elem);

    let words_per_row = shape.k_main / 8;
    let keeper_words = KEEPER_K / PACK_I8;
    let groups = shape.groups();
    let m_pad = scale_rows_padded(shape.m);

    for (name, handle) in [
        ("a", a),
        ("b", b),
        ("a_keeper", a_keeper),
        ("b_keeper", b_keeper),
    ] {
        assert_eq!(
            handle.elem_size,
            core::mem::size_of::<u32>(),
            "packed {name} must use 32-bit words, got elem_size={}",
            handle.elem_size
        );
    }

    // Scale tables and the output must carry the launch float type, or the
    // linear views below would reinterpret their bytes at the wrong width.
    for (name, handle) in [
        ("a_scales", a_scales),
        ("b_scales", b_scales),
        ("a_keeper_scale", a_keeper_scale),
        ("b_keeper_scale", b_keeper_scale),
        ("output", output),
    ] {
        assert_eq!(
            handle.elem_size,
            elem,
            "{name} must use {elem}-byte elements for this launch, got elem_size={}",
            handle.elem_size
        );
    }

    assert_eq!(a.shape, [shape.m, words_per_row], "a must be [m, k_main/8]");
    assert_eq!(b.shape, [shape.n, words_per_row], "b must be [n, k_main/8]");
    assert_eq!(
        a_scales.shape,
        [groups, m_pad],
        "a_scales must be [groups, m padded to {SCALE_SPAN}]"
    );
    assert_eq!(
        b_scales.shape,
        [groups, shape.n],
        "b_scales must be [groups, n]"
    );
    assert_eq!(
        a_keeper.shape,
        [shape.m, keeper_words],
        "a_keeper must be [m, {keeper_words}]"
    );
    assert_eq!(
        b_keeper.shape,
        [shape.n, keeper_words],
        "b_keeper must be [n, {keeper_words}]"
    );
    assert_eq!(a_keeper_scale.shape, [shape.m], "a_keeper_scale must be [m]");
    assert_eq!(b_keeper_scale.shape, [shape.n], "b_keeper_scale must be [n]");

    assert!(!output.shape.is_empty(), "output must have rank >= 1");
    let out_n = output.shape[output.shape.len() - 1];
    assert_eq!(out_n, shape.n, "output N must match shape.n");
    let out_numel = output.shape.iter().product::<usize>();
    assert_eq!(out_numel, shape.m * shape.n, "output must be [m, n]");

    let units_x = shape.tile_n / COLS_PER_UNIT;
    let units_y = shape.tile_m / ROWS_PER_UNIT;
    let m_tiles = shape.m.div_ceil(shape.tile_m);
    let n_tiles = shape.n / shape.tile_n;
    let total_cubes = m_tiles * n_tiles;
    let units_per_cube = units_x * units_y;

    let cube_dim = CubeDim::new_2d(units_x as u32, units_y as u32);
    let cube_count = calculate_cube_count_elemwise(client, total_cubes * units_per_cube, cube_dim);

    w4a4_gemm::launch::<F, R>(
        client,
        cube_count,
        cube_dim,
        linear_view(client, a, CHUNK_U32),
        linear_view(client, b, CHUNK_U32),
        linear_view(client, a_scales, 2),
        linear_view(client, b_scales, 2),
        linear_view(client, a_keeper, CHUNK_U32),
        linear_view(client, b_keeper, CHUNK_U32),
        linear_view(client, a_keeper_scale, 1),
        linear_view(client, b_keeper_scale, 1),
        linear_view(client, output, CHUNK_U32),
        *shape,
    )
}
