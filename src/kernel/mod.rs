pub mod layout;
pub mod w4a4_kernel;
pub mod w4a4_kernel_gemm;

use burn_cubecl::{
    tensor::CubeTensor, BoolElement, CubeBackend, CubeRuntime, FloatElement, IntElement,
};
use burn_tensor::{DType, Int, Tensor, TensorMetadata, TensorPrimitive};
use cubecl::prelude::*;
use half::f16;

use layout::KEEPER_K;
use w4a4_kernel::dequantize_native;
use w4a4_kernel_gemm::{w4a4_gemm_launch, ShapeConfig};

/// Element type of the output matrix (and of the scale tables fed to the
/// kernel at the same precision).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    F32,
    F16,
    Fp8,
}

/// Dispatches the fused GEMM for the requested output type.
///
/// Returns `Ok(true)` when a kernel was launched, `Ok(false)` when the output
/// type is not supported by this build (8-bit float output has no device
/// codegen path here). Launch-level failures surface as `Err`.
#[allow(clippy::too_many_arguments)]
pub fn launch_w4a4_gemm<R: Runtime>(
    client: &ComputeClient<R>,
    kind: OutputKind,
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
) -> Result<bool, LaunchError> {
    match kind {
        OutputKind::F32 => {
            w4a4_gemm_launch::<R, f32>(
                client,
                a,
                b,
                a_scales,
                b_scales,
                a_keeper,
                b_keeper,
                a_keeper_scale,
                b_keeper_scale,
                output,
                shape,
            )?;
            Ok(true)
        }
        OutputKind::F16 => {
            w4a4_gemm_launch::<R, f16>(
                client,
                a,
                b,
                a_scales,
                b_scales,
                a_keeper,
                b_keeper,
                a_keeper_scale,
                b_keeper_scale,
                output,
                shape,
            )?;
            Ok(true)
        }
        OutputKind::Fp8 => Ok(false),
    }
}

/// Dequantizes a packed weight into its float form `(n, k_main + keeper)`,
/// for the matmul fallback path.
pub fn dequantize_w4a4<R: CubeRuntime, F: FloatElement, I: IntElement, BT: BoolElement>(
    weight: Tensor<CubeBackend<R, F, I, BT>, 2, Int>,
    scales: Tensor<CubeBackend<R, F, I, BT>, 2>,
    keeper: Tensor<CubeBackend<R, F, I, BT>, 2, Int>,
    keeper_scales: Tensor<CubeBackend<R, F, I, BT>, 1>,
) -> CubeTensor<R> {
    let device = weight.device();
    let w_primitive = weight.into_primitive();
    let k_primitive = keeper.into_primitive();
    let s_primitive = match scales.into_primitive() {
        TensorPrimitive::Float(f) => f,
        _ => panic!("scales must be a float tensor"),
    };
    let ks_primitive = match keeper_scales.into_primitive() {
        TensorPrimitive::Float(f) => f,
        _ => panic!("keeper_scales must be a float tensor"),
    };

    assert!(matches!(w_primitive.dtype(), DType::I32 | DType::U32));
    assert!(matches!(k_primitive.dtype(), DType::I32 | DType::U32));

    let client = w_primitive.client.clone();

    let n = *w_primitive.shape().first().unwrap();
    let k_main = *w_primitive.shape().last().unwrap() * 8;
    let out_shape = vec![n, k_main + KEEPER_K];

    let out: Tensor<CubeBackend<R, F, I, BT>, 2> = Tensor::empty(out_shape, &device);
    let o_primitive = match out.into_primitive() {
        TensorPrimitive::Float(f) => f,
        _ => panic!("empty output must be a float tensor"),
    };

    dequantize_native::<R, F>(
        &client,
        &w_primitive.as_handle_ref(),
        &s_primitive.as_handle_ref(),
        &k_primitive.as_handle_ref(),
        &ks_primitive.as_handle_ref(),
        &o_primitive.as_handle_ref(),
    )
    .expect("dequantize launch failed");

    o_primitive
}
