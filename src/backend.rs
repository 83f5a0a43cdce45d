//! 計算バックエンドの型エイリアス

use burn_autodiff::Autodiff;

/// CPU推論用
pub type CpuBackend = burn_ndarray::NdArray<f32>;
/// CPU学習用
pub type CpuTrainingBackend = Autodiff<CpuBackend>;

/// GPU推論用
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;
/// GPU学習用
#[cfg(feature = "wgpu")]
pub type GpuTrainingBackend = Autodiff<GpuBackend>;
