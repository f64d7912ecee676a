pub mod kernel;
pub mod modules;

pub use kernel::OutputKind;
pub use modules::{
    QuantizedActivations, W4A4GemmLinear, W4A4GemmLinearConfig, W4A4Linear, W4A4LinearConfig,
};
