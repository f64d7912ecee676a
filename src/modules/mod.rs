pub mod w4a4_dequantize;
pub mod w4a4_gemm;

pub use w4a4_dequantize::{W4A4Linear, W4A4LinearConfig};
pub use w4a4_gemm::{QuantizedActivations, W4A4GemmLinear, W4A4GemmLinearConfig};
