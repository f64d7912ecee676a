use cubecl::prelude::*;
use cubecl::{
    calculate_cube_count_elemwise,
    std::tensor::layout::linear::{linear_view, LinearView},
};

use crate::kernel::layout::{GROUP_K, KEEPER_K, PACK_I4, PACK_I8};

// The helper funcs. Values are signed, little-nibble-first.
#[cube]
fn unpack_i4<F: Float>(packed_value: u32, #[comptime] size: usize) -> Line<F> {
    let mut unpacked_line = Line::<F>::empty(size);

    #[unroll]
    for idx in 0..size {
        let shift = idx * 4;
        let v = (i32::cast_from((packed_value >> shift) & 0xF) ^ 8) - 8;
        unpacked_line[idx] = F::cast_from(v);
    }
    unpacked_line
}

#[cube]
fn unpack_i8<F: Float>(packed_value: u32, #[comptime] size: usize) -> Line<F> {
    let mut unpacked_line = Line::<F>::empty(size);

    #[unroll]
    for idx in 0..size {
        let shift = idx * 8;
        let v = (i32::cast_from((packed_value >> shift) & 0xFF) ^ 0x80) - 0x80;
        unpacked_line[idx] = F::cast_from(v);
    }
    unpacked_line
}

// Working unit: one packed word, 8 output values.
// weights (n, k_main/8), scales (groups, n), output (n, k_main + keeper)
#[cube(launch_unchecked)]
fn dequantize_w4_symmetric<F: Float>(
    weights: &LinearView<u32>,
    scales: &LinearView<F>,
    output: &mut LinearView<Line<F>, ReadWrite>,
    words_per_row: usize,
    out_width: usize,
    n: usize,
) {
    let word = weights[ABSOLUTE_POS];

    let row_idx = ABSOLUTE_POS / words_per_row;
    let word_idx = ABSOLUTE_POS % words_per_row;

    let group_idx = word_idx * PACK_I4 / GROUP_K;
    let scale = scales[group_idx * n + row_idx];

    let values = unpack_i4::<F>(word, PACK_I4);
    output[(row_idx * out_width + word_idx * PACK_I4) / PACK_I4] =
        values * Line::<F>::empty(PACK_I4).fill(scale);
}

// Keeper columns land after the main body, 4 output values per word.
// keepers (n, keeper/4), keeper_scales (n)
#[cube(launch_unchecked)]
fn dequantize_keeper<F: Float>(
    keepers: &LinearView<u32>,
    keeper_scales: &LinearView<F>,
    output: &mut LinearView<Line<F>, ReadWrite>,
    out_width: usize,
    k_main: usize,
) {
    let keeper_words = KEEPER_K / PACK_I8;
    let word = keepers[ABSOLUTE_POS];

    let row_idx = ABSOLUTE_POS / keeper_words;
    let word_idx = ABSOLUTE_POS % keeper_words;

    let scale = keeper_scales[row_idx];
    let values = unpack_i8::<F>(word, PACK_I8);
    output[(row_idx * out_width + k_main + word_idx * PACK_I8) / PACK_I8] =
        values * Line::<F>::empty(PACK_I8).fill(scale);
}

/// Reconstructs the float weight matrix `(n, k_main + keeper)` from packed
/// int4 rows, group scales, and the int8 keeper extension.
pub fn dequantize_native<R: Runtime, E: Float>(
    client: &ComputeClient<R>,
    q_weight: &TensorHandleRef<R>,
    scales: &TensorHandleRef<R>,
    keeper: &TensorHandleRef<R>,
    keeper_scales: &TensorHandleRef<R>,
    output: &TensorHandleRef<R>,
) -> Result<(), LaunchError> {
    // Packed operands must be 32-bit words; other element sizes would
    // silently corrupt indexing.
    assert_eq!(
        q_weight.elem_size,
        core::mem::size_of::<u32>(),
        "packed q_weight must use 32-bit elements, got elem_size={}",
        q_weight.elem_size
    );
    assert_eq!(
        keeper.elem_size,
        core::mem::size_of::<u32>(),
        "packed keeper must use 32-bit elements, got elem_size={}",
        keeper.elem_size
    );

    let n = q_weight.shape[0];
    let words_per_row = q_weight.shape[1];
    let k_main = words_per_row * PACK_I4;
    let out_width = k_main + KEEPER_K;

    assert!(k_main.is_multiple_of(GROUP_K), "k_main must be group aligned");
    assert_eq!(scales.shape, [k_main / GROUP_K, n], "scales must be [groups, n]");
    assert_eq!(
        keeper.shape,
        [n, KEEPER_K / PACK_I8],
        "keeper must be [n, {}]",
        KEEPER_K / PACK_I8
    );
    assert_eq!(keeper_scales.shape, [n], "keeper_scales must be [n]");
    assert_eq!(output.shape, [n, out_width], "output must be [n, k_main + keeper]");

    let cube_dim = CubeDim::new(client, 256);

    let num_words = n * words_per_row;
    let cube_count = calculate_cube_count_elemwise(client, num_words, cube_dim);
    unsafe {
        dequantize_w4_symmetric::launch_unchecked::<E, R>(
            client,
            cube_count,
            cube_dim,
            linear_view(client, q_weight, 1),
            linear_view(client, scales, 1),
            linear_view(client, output, PACK_I4),
            ScalarArg::new(words_per_row),
            ScalarArg::new(out_width),
            ScalarArg::new(n),
        );
    };

    let num_keeper_words = n * KEEPER_K / PACK_I8;
    let keeper_count = calculate_cube_count_elemwise(client, num_keeper_words, cube_dim);
    unsafe {
        dequantize_keeper::launch_unchecked::<E, R>(
            client,
            keeper_count,
            cube_dim,
            linear_view(client, keeper, 1),
            linear_view(client, keeper_scales, 1),
            linear_view(client, output, PACK_I8),
            ScalarArg::new(out_width),
            ScalarArg::new(k_main),
        );
    };

    Ok(())
}
