use anyhow::ensure;
use serde::Deserialize;

use crate::compute::DIM;
use crate::fabric::types::Addr;
use crate::sim::config::Config;

/// Tiled matrix multiply `C[m×n] = A[m×k] · B[k×n]` over random i8 inputs.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkloadConfig {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub seed: u64,
    /// Main-memory offset where operand and result tiles are staged.
    pub staging_base: Addr,
}

impl Config for WorkloadConfig {}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            m: 16,
            k: 16,
            n: 16,
            seed: 1,
            staging_base: 0x1_0000,
        }
    }
}

impl WorkloadConfig {
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        for (name, dim) in [("m", self.m), ("k", self.k), ("n", self.n)] {
            ensure!(
                dim > 0 && dim % DIM == 0,
                "workload dimension {} = {} must be a positive multiple of {}",
                name,
                dim,
                DIM
            );
        }
        ensure!(self.staging_base % 4 == 0, "staging_base must be word aligned");
        Ok(())
    }

    pub fn num_jobs(&self) -> usize {
        (self.m / DIM) * (self.k / DIM) * (self.n / DIM)
    }
}

/// 2D convolution of a `channels`×`height`×`width` i8 input with `filters` kernels of
/// `channels`×`kernel_h`×`kernel_w`, lowered onto the tiled multiply through im2col.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConvConfig {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub filters: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    /// Zero padding added to every edge.
    pub pad: usize,
    pub seed: u64,
    pub staging_base: Addr,
}

impl Config for ConvConfig {}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            height: 8,
            width: 8,
            channels: 2,
            filters: 4,
            kernel_h: 3,
            kernel_w: 3,
            stride: 1,
            pad: 1,
            seed: 1,
            staging_base: 0x1_0000,
        }
    }
}

impl ConvConfig {
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("height", self.height),
            ("width", self.width),
            ("channels", self.channels),
            ("filters", self.filters),
            ("kernel_h", self.kernel_h),
            ("kernel_w", self.kernel_w),
            ("stride", self.stride),
        ] {
            ensure!(value > 0, "conv {} must be positive", name);
        }
        ensure!(
            self.kernel_h <= self.height + 2 * self.pad && self.kernel_w <= self.width + 2 * self.pad,
            "{}x{} kernel does not fit the padded {}x{} input",
            self.kernel_h,
            self.kernel_w,
            self.height,
            self.width
        );
        ensure!(self.staging_base % 4 == 0, "staging_base must be word aligned");
        Ok(())
    }

    /// Output rows and columns.
    pub fn output_dims(&self) -> (usize, usize) {
        (
            (self.height + 2 * self.pad - self.kernel_h) / self.stride + 1,
            (self.width + 2 * self.pad - self.kernel_w) / self.stride + 1,
        )
    }

    /// Length of one im2col column: one input patch across every channel.
    pub fn patch_len(&self) -> usize {
        self.channels * self.kernel_h * self.kernel_w
    }
}
