use cubecl::prelude::*;

/// Contraction-dimension slice that shares one (row-scale, col-scale) pair.
pub const GROUP_K: usize = 128;
/// Depth of the int8 keeper extension. Always present, always this deep.
pub const KEEPER_K: usize = 128;
/// Signed 4-bit values packed per u32 word.
pub const PACK_I4: usize = 8;
/// Signed 8-bit values packed per u32 word.
pub const PACK_I8: usize = 4;
/// Transfer granularity of the copy pipeline: one `Line<u32>` of 4.
pub const CHUNK_U32: usize = 4;
/// 4-bit values covered by one 16-byte chunk.
pub const I4_PER_CHUNK: usize = CHUNK_U32 * PACK_I4;
/// 8-bit values covered by one 16-byte chunk.
pub const I8_PER_CHUNK: usize = CHUNK_U32 * PACK_I8;
/// 16-byte chunks per operand row in the 4-bit phase (one K-group deep).
pub const I4_CHUNKS_PER_ROW: usize = GROUP_K / I4_PER_CHUNK;
/// 16-byte chunks per operand row in the keeper phase.
pub const I8_CHUNKS_PER_ROW: usize = KEEPER_K / I8_PER_CHUNK;
/// Row span of the A-scale permutation. Scale tables are padded to this.
pub const SCALE_SPAN: usize = 16;

/// Scratchpad column permutation shared by the loader and the fragment
/// extractor. XOR-ing the chunk column with the row's low bits spreads
/// consecutive rows across banks; applying it twice recovers the column, so
/// writer and reader stay in lockstep by construction.
#[cube]
pub fn swizzled_chunk_col(row: usize, col: usize, #[comptime] chunks_per_row: usize) -> usize {
    col ^ (row & (chunks_per_row - 1))
}

/// Position-dependent layout of the A-side scale table: rows are remapped
/// inside each aligned 16-row span (even rows first, then odd rows) so that a
/// tile-local span of scales is one contiguous run of paired values. The
/// packer stores scale(row) at index `scale_perm(row)`; the in-kernel scale
/// register loader applies the same function when fetching.
#[cube]
pub fn scale_perm(row: usize) -> usize {
    let span = row & (!(SCALE_SPAN as u32 - 1) as usize);
    let within = row & (SCALE_SPAN - 1);
    span | ((within & 1) << 3) | (within >> 1)
}

/// Rows of the A-scale table after padding to the permutation span.
pub fn scale_rows_padded(m: usize) -> usize {
    m.div_ceil(SCALE_SPAN) * SCALE_SPAN
}

/// Number of K-groups covering `k_main` (the final group may be partial; the
/// loader's K predicate zero-fills past the end).
pub fn k_groups(k_main: usize) -> usize {
    k_main.div_ceil(GROUP_K)
}

/// Maps a logical (row, col) element of a packed 4-bit matrix to its byte
/// offset and nibble selector (0 = low nibble). Kept in one place so the
/// packer, the CPU reference and the kernel's word indexing cannot drift.
pub fn nibble_address(row: usize, col: usize, k: usize) -> (usize, u32) {
    debug_assert!(col < k);
    let byte = row * (k / 2) + col / 2;
    (byte, (col & 1) as u32)
}

fn encode_i4(value: i8) -> u32 {
    debug_assert!((-8..=7).contains(&value), "int4 range is [-8, 7]");
    (value as u32) & 0xF
}

/// Sign-extends one nibble of a packed word.
pub fn decode_i4(word: u32, lane: usize) -> i32 {
    let nibble = ((word >> (lane * 4)) & 0xF) as i32;
    (nibble ^ 8) - 8
}

/// Sign-extends one byte of a packed word.
pub fn decode_i8(word: u32, lane: usize) -> i32 {
    let byte = ((word >> (lane * 8)) & 0xFF) as i32;
    (byte ^ 0x80) - 0x80
}

/// Packs a row-major `rows x k` matrix of int4 values, 8 per u32,
/// little-nibble-first. `k` must be a multiple of [`I4_PER_CHUNK`] so every
/// row is whole 16-byte chunks.
pub fn pack_i4_rows(values: &[i8], rows: usize, k: usize) -> Vec<u32> {
    assert_eq!(values.len(), rows * k);
    assert_eq!(k % I4_PER_CHUNK, 0, "k must be a multiple of {I4_PER_CHUNK}");
    let words_per_row = k / PACK_I4;
    let mut packed = vec![0_u32; rows * words_per_row];
    for row in 0..rows {
        for col in 0..k {
            let word = row * words_per_row + col / PACK_I4;
            packed[word] |= encode_i4(values[row * k + col]) << ((col % PACK_I4) * 4);
        }
    }
    packed
}

/// Packs a row-major `rows x KEEPER_K` int8 matrix, 4 per u32,
/// little-byte-first.
pub fn pack_i8_rows(values: &[i8], rows: usize) -> Vec<u32> {
    assert_eq!(values.len(), rows * KEEPER_K);
    let words_per_row = KEEPER_K / PACK_I8;
    let mut packed = vec![0_u32; rows * words_per_row];
    for row in 0..rows {
        for col in 0..KEEPER_K {
            let word = row * words_per_row + col / PACK_I8;
            packed[word] |= ((values[row * KEEPER_K + col] as u8) as u32) << ((col % PACK_I8) * 8);
        }
    }
    packed
}

/// Builds the A-side scale table: `groups x scale_rows_padded(m)`, with each
/// group's rows stored at their [`scale_perm`] position. Padding rows carry
/// zero; the kernel never folds them into a live output row.
pub fn build_a_scale_table(scales: &[f32], m: usize, groups: usize) -> Vec<f32> {
    assert_eq!(scales.len(), groups * m);
    let m_pad = scale_rows_padded(m);
    let mut table = vec![0.0_f32; groups * m_pad];
    for group in 0..groups {
        for row in 0..m {
            table[group * m_pad + scale_perm(row)] = scales[group * m + row];
        }
    }
    table
}

/// Scratchpad footprint of one cube, per the sizing contract: the operand and
/// scale staging rings, or the output tile if the (reused) epilogue staging is
/// larger. `scale_elem` and `out_elem` are the byte widths of the launch float
/// type.
pub fn scratchpad_bytes(
    tile_m: usize,
    tile_n: usize,
    stages: usize,
    scale_elem: usize,
    out_elem: usize,
) -> usize {
    let operand_stage = (tile_m + tile_n) * GROUP_K / 2;
    let scale_stage = (tile_m + tile_n) * scale_elem;
    let pipeline = (operand_stage + scale_stage) * stages;
    let output_tile = tile_m * tile_n * out_elem;
    pipeline.max(output_tile)
}
