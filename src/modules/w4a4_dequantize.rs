use crate::kernel::dequantize_w4a4;
use crate::kernel::layout::{GROUP_K, KEEPER_K, PACK_I4, PACK_I8};
use burn::prelude::*;
use burn_cubecl::{
    kernel::matmul::{matmul, MatmulStrategy},
    BoolElement, CubeBackend, CubeRuntime, FloatElement, IntElement,
};
use burn_tensor::TensorPrimitive;

#[derive(Clone, Debug)]
pub struct W4A4LinearConfig {
    d_input: usize,
    d_output: usize,
}

impl W4A4LinearConfig {
    pub fn new(d_input: usize, d_output: usize) -> Self {
        Self { d_input, d_output }
    }

    pub fn build<B: Backend>(&self, device: &Device<B>) -> W4A4Linear<B> {
        assert!(self.d_input % GROUP_K == 0);
        let words_per_row = self.d_input / PACK_I4;
        let num_groups = self.d_input / GROUP_K;

        let qweight = Tensor::<B, 2, Int>::empty([self.d_output, words_per_row], device);
        let scales = Tensor::<B, 2>::empty([num_groups, self.d_output], device);
        let keeper = Tensor::<B, 2, Int>::empty([self.d_output, KEEPER_K / PACK_I8], device);
        let keeper_scales = Tensor::<B, 1>::empty([self.d_output], device);

        W4A4Linear {
            qweight,
            scales,
            keeper,
            keeper_scales,
        }
    }
}

/// Fallback linear layer: reconstructs the float weight on device and runs a
/// dense matmul. Used where the fused kernel's output type or geometry is not
/// available.
///
/// The float input is expected to already carry the keeper channels, so its
/// last dim is `d_input + keeper depth`.
#[derive(Debug, Module)]
pub struct W4A4Linear<B: Backend> {
    qweight: Tensor<B, 2, Int>,
    scales: Tensor<B, 2, Float>,
    keeper: Tensor<B, 2, Int>,
    keeper_scales: Tensor<B, 1>,
}

impl<B: Backend> W4A4Linear<B> {
    pub fn d_output(&self) -> usize {
        *self.qweight.shape().first().unwrap()
    }

    pub fn d_input(&self) -> usize {
        *self.qweight.shape().last().unwrap() * PACK_I4
    }
}

impl<R: CubeRuntime, I: IntElement, F: FloatElement, BT: BoolElement>
    W4A4Linear<CubeBackend<R, F, I, BT>>
{
    /// Float weight `(d_output, d_input + keeper depth)`.
    pub fn dequantize(&self) -> Tensor<CubeBackend<R, F, I, BT>, 2> {
        let weight_primitive = dequantize_w4a4(
            self.qweight.clone(),
            self.scales.clone(),
            self.keeper.clone(),
            self.keeper_scales.clone(),
        );
        Tensor::<CubeBackend<R, F, I, BT>, 2>::from_primitive(TensorPrimitive::Float(
            weight_primitive,
        ))
    }

    pub fn forward<const D: usize>(
        &self,
        input: Tensor<CubeBackend<R, F, I, BT>, D>,
    ) -> Tensor<CubeBackend<R, F, I, BT>, D> {
        let dtype = input.dtype();

        let weight = self.dequantize().swap_dims(0, 1);
        let weight_primitive = match weight.into_primitive() {
            TensorPrimitive::Float(f) => f,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };

        let input_primitive = match input.into_primitive() {
            TensorPrimitive::Float(f) => f,
            TensorPrimitive::QFloat(_) => panic!("unsupported qfloat"),
        };

        let out_primitive = matmul(
            input_primitive,
            weight_primitive,
            None,
            MatmulStrategy::Autotune,
            dtype,
        )
        .expect("matmul launch failed");
        Tensor::<CubeBackend<R, F, I, BT>, D>::from_primitive(TensorPrimitive::Float(out_primitive))
    }
}
