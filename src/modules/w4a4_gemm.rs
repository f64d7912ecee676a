use crate::kernel::layout::{scale_rows_padded, GROUP_K, KEEPER_K, PACK_I4, PACK_I8};
use crate::kernel::w4a4_kernel_gemm::{ShapeConfig, STAGES_DEFAULT, TILE_DEFAULT};
use crate::kernel::{launch_w4a4_gemm, OutputKind};
use burn::{
    module::{Param, ParamId},
    prelude::*,
};
use burn_cubecl::{BoolElement, CubeBackend, CubeRuntime, FloatElement, IntElement};
use burn_tensor::{DType, Int, TensorPrimitive};
use std::sync::OnceLock;

const TILE_N_BASE: usize = 32;
const TILE_N_MEDIUM: usize = 64;
const TILE_M_SMALL: usize = 32;
const TILE_M_MEDIUM: usize = 64;

fn forced_tile_m_from_env() -> Option<usize> {
    static FORCED_TILE_M: OnceLock<Option<usize>> = OnceLock::new();
    *FORCED_TILE_M.get_or_init(|| {
        std::env::var("W4A4_GEMM_FORCE_TILE_M")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|tile| matches!(tile, 32 | 64 | 128))
    })
}

fn select_tile_m(m: usize) -> usize {
    if let Some(forced_tile) = forced_tile_m_from_env() {
        return forced_tile;
    }

    if m <= TILE_M_SMALL {
        TILE_M_SMALL
    } else if m <= TILE_M_MEDIUM {
        TILE_M_MEDIUM
    } else {
        TILE_DEFAULT
    }
}

fn select_tile_n(n: usize) -> usize {
    if n >= TILE_DEFAULT && n % TILE_DEFAULT == 0 {
        TILE_DEFAULT
    } else if n >= TILE_N_MEDIUM && n % TILE_N_MEDIUM == 0 {
        TILE_N_MEDIUM
    } else {
        TILE_N_BASE
    }
}

// Smaller tiles run the shallow ring to cut per-cube scratchpad.
fn select_stages(tile_m: usize, tile_n: usize) -> usize {
    if tile_m == TILE_DEFAULT && tile_n == TILE_DEFAULT {
        STAGES_DEFAULT
    } else {
        2
    }
}

fn output_kind_for(dtype: DType) -> OutputKind {
    match dtype {
        DType::F32 => OutputKind::F32,
        DType::F16 => OutputKind::F16,
        _ => OutputKind::Fp8,
    }
}

/// Quantized input activations for the fused GEMM: packed int4 rows, the
/// permuted group-scale table, and the int8 keeper slice.
///
/// `rows` is the logical row count; the storage may carry extra rows that the
/// kernel masks out.
#[derive(Clone, Debug)]
pub struct QuantizedActivations<B: Backend> {
    values: Tensor<B, 2, Int>,
    scales: Tensor<B, 2>,
    keeper: Tensor<B, 2, Int>,
    keeper_scales: Tensor<B, 1>,
    rows: usize,
}

impl<B: Backend> QuantizedActivations<B> {
    pub fn from_parts(
        values: Tensor<B, 2, Int>,
        scales: Tensor<B, 2>,
        keeper: Tensor<B, 2, Int>,
        keeper_scales: Tensor<B, 1>,
        rows: usize,
    ) -> Self {
        let [m_storage, words] = values.dims();
        assert!(rows > 0 && rows <= m_storage, "rows must be in 1..=storage rows");
        assert!(
            (words * PACK_I4).is_multiple_of(GROUP_K),
            "packed width must cover whole groups"
        );
        let [groups, scale_rows] = scales.dims();
        assert_eq!(groups, words * PACK_I4 / GROUP_K, "scale rows must be K/{GROUP_K}");
        assert_eq!(
            scale_rows,
            scale_rows_padded(m_storage),
            "scale table must be padded to the permutation span"
        );
        assert_eq!(keeper.dims(), [m_storage, KEEPER_K / PACK_I8]);
        assert_eq!(keeper_scales.dims(), [m_storage]);

        Self {
            values,
            scales,
            keeper,
            keeper_scales,
            rows,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn k_main(&self) -> usize {
        let [_, words] = self.values.dims();
        words * PACK_I4
    }
}

#[derive(Clone, Debug)]
pub struct W4A4GemmLinearConfig {
    d_input: usize,
    d_output: usize,
    bias: bool,
}

impl W4A4GemmLinearConfig {
    /// `d_input` is the main contraction depth; the keeper extension adds its
    /// fixed depth on top.
    pub fn new(d_input: usize, d_output: usize) -> Self {
        Self {
            d_input,
            d_output,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn build<B: Backend>(&self, device: &Device<B>) -> W4A4GemmLinear<B> {
        assert!(
            self.d_input.is_multiple_of(GROUP_K),
            "d_input must be divisible by the group size ({GROUP_K})"
        );
        assert!(
            self.d_output.is_multiple_of(TILE_N_BASE),
            "d_output must be divisible by TILE_N ({TILE_N_BASE})"
        );

        let words_per_row = self.d_input / PACK_I4;
        let num_groups = self.d_input / GROUP_K;

        let qweight = Param::initialized(
            ParamId::new(),
            Tensor::<B, 2, Int>::empty([self.d_output, words_per_row], device),
        );
        let scales = Param::initialized(
            ParamId::new(),
            Tensor::<B, 2>::empty([num_groups, self.d_output], device),
        );
        let keeper = Param::initialized(
            ParamId::new(),
            Tensor::<B, 2, Int>::empty([self.d_output, KEEPER_K / PACK_I8], device),
        );
        let keeper_scales = Param::initialized(
            ParamId::new(),
            Tensor::<B, 1>::empty([self.d_output], device),
        );
        let bias = self.bias.then(|| {
            Param::initialized(
                ParamId::new(),
                Tensor::<B, 1>::zeros([self.d_output], device),
            )
        });

        W4A4GemmLinear {
            qweight,
            scales,
            keeper,
            keeper_scales,
            bias,
        }
    }
}

/// Linear layer over the fused W4A4 kernel. The weight is stored transposed,
/// `(d_output, d_input)` packed int4, with per-group scales and the int8
/// keeper slice.
#[derive(Debug, Module)]
pub struct W4A4GemmLinear<B: Backend> {
    qweight: Param<Tensor<B, 2, Int>>,
    scales: Param<Tensor<B, 2, Float>>,
    keeper: Param<Tensor<B, 2, Int>>,
    keeper_scales: Param<Tensor<B, 1>>,
    bias: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> W4A4GemmLinear<B> {
    pub fn d_output(&self) -> usize {
        *self.qweight.val().shape().first().unwrap()
    }

    pub fn d_input(&self) -> usize {
        *self.qweight.val().shape().last().unwrap() * PACK_I4
    }
}

impl<R: CubeRuntime, I: IntElement, F: FloatElement, BT: BoolElement>
    W4A4GemmLinear<CubeBackend<R, F, I, BT>>
{
    pub fn forward(
        &self,
        input: &QuantizedActivations<CubeBackend<R, F, I, BT>>,
    ) -> Tensor<CubeBackend<R, F, I, BT>, 2> {
        let m = input.rows();
        let k_main = input.k_main();
        let n = self.d_output();
        assert_eq!(
            k_main,
            self.d_input(),
            "activation K must match weight d_input"
        );

        let a = input.values.clone();
        let a_scales = input.scales.clone();
        let a_keeper = input.keeper.clone();
        let a_keeper_scale = input.keeper_scales.clone();
        let qweight = self.qweight.val();
        let scales = self.scales.val();
        let keeper = self.keeper.val();
        let keeper_scales = self.keeper_scales.val();

        assert!(
            matches!(a.dtype(), DType::I32 | DType::U32),
            "activation words must have i32/u32 dtype"
        );
        assert!(
            matches!(qweight.dtype(), DType::I32 | DType::U32),
            "qweight must have i32/u32 dtype"
        );

        let m_storage = *a.shape().first().unwrap();
        let device = a.device();
        let output =
            Tensor::<CubeBackend<R, F, I, BT>, 2>::empty([m_storage, n], &device);

        let a_primitive = a.into_primitive();
        let a_scales_primitive = match a_scales.into_primitive() {
            TensorPrimitive::Float(float) => float,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };
        let a_keeper_primitive = a_keeper.into_primitive();
        let a_keeper_scale_primitive = match a_keeper_scale.into_primitive() {
            TensorPrimitive::Float(float) => float,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };
        let qweight_primitive = qweight.into_primitive();
        let scales_primitive = match scales.into_primitive() {
            TensorPrimitive::Float(float) => float,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };
        let keeper_primitive = keeper.into_primitive();
        let keeper_scales_primitive = match keeper_scales.into_primitive() {
            TensorPrimitive::Float(float) => float,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };
        let output_primitive = match output.into_primitive() {
            TensorPrimitive::Float(float) => float,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };

        let tile_m = select_tile_m(m);
        let tile_n = select_tile_n(n);
        let stages = select_stages(tile_m, tile_n);
        let shape = ShapeConfig::with_tiling_and_valid_m(
            m_storage,
            n,
            k_main + KEEPER_K,
            tile_m,
            tile_n,
            stages,
            m,
        );

        let kind = output_kind_for(F::dtype());
        let launched = launch_w4a4_gemm::<R>(
            &a_primitive.client,
            kind,
            &a_primitive.as_handle_ref(),
            &qweight_primitive.as_handle_ref(),
            &a_scales_primitive.as_handle_ref(),
            &scales_primitive.as_handle_ref(),
            &a_keeper_primitive.as_handle_ref(),
            &keeper_primitive.as_handle_ref(),
            &a_keeper_scale_primitive.as_handle_ref(),
            &keeper_scales_primitive.as_handle_ref(),
            &output_primitive.as_handle_ref(),
            &shape,
        )
        .expect("W4A4 GEMM launch failed");
        assert!(
            launched,
            "output dtype {:?} is not supported by the fused kernel",
            F::dtype()
        );

        let output = Tensor::<CubeBackend<R, F, I, BT>, 2>::from_primitive(TensorPrimitive::Float(
            output_primitive,
        ));
        let output = if m_storage == m {
            output
        } else {
            output.slice([0..m, 0..n])
        };

        match &self.bias {
            Some(bias) => output + bias.val().reshape([1, n]),
            None => output,
        }
    }
}
