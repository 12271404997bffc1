use anyhow::ensure;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::compute::DIM;
use crate::sim::top::Fabric;
use crate::timeq::Cycle;
use crate::workload::config::{ConvConfig, WorkloadConfig};
use crate::workload::tiled::{TiledMatmul, WorkloadReport};

#[derive(Debug, Clone, Serialize)]
pub struct ConvReport {
    pub output_h: usize,
    pub output_w: usize,
    pub filters: usize,
    /// The lowered multiply, with dimensions padded to whole tiles.
    pub matmul: WorkloadReport,
    /// Output elements that differ from a direct convolution.
    pub mismatches: usize,
    pub passed: bool,
}

/// Convolution run as `kernels[filters × patch] · im2col[patch × pixels]` on the compute
/// array. Both operands are zero-padded up to whole 4×4 tiles; the padding contributes nothing
/// to the retained `filters × pixels` corner of the product.
pub struct Conv2d {
    config: ConvConfig,
    /// `channels × height × width`, row-major.
    input: Vec<i8>,
    /// `filters × channels × kernel_h × kernel_w`, row-major.
    kernels: Vec<i8>,
}

fn round_up(value: usize) -> usize {
    value.div_ceil(DIM) * DIM
}

impl Conv2d {
    pub fn new(config: ConvConfig) -> anyhow::Result<Self> {
        config.ensure_valid()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let input = (0..config.channels * config.height * config.width)
            .map(|_| rng.gen::<i8>())
            .collect();
        let kernels = (0..config.filters * config.patch_len())
            .map(|_| rng.gen::<i8>())
            .collect();
        Self::with_inputs(config, input, kernels)
    }

    pub fn with_inputs(config: ConvConfig, input: Vec<i8>, kernels: Vec<i8>) -> anyhow::Result<Self> {
        config.ensure_valid()?;
        let input_len = config.channels * config.height * config.width;
        ensure!(
            input.len() == input_len,
            "conv input has {} elements, expected {}",
            input.len(),
            input_len
        );
        let kernels_len = config.filters * config.patch_len();
        ensure!(
            kernels.len() == kernels_len,
            "conv kernels have {} elements, expected {}",
            kernels.len(),
            kernels_len
        );
        Ok(Self {
            config,
            input,
            kernels,
        })
    }

    /// Input element at a padded coordinate, zero outside the image.
    fn pixel(&self, c: usize, y: isize, x: isize) -> i8 {
        let (h, w) = (self.config.height as isize, self.config.width as isize);
        if y < 0 || y >= h || x < 0 || x >= w {
            return 0;
        }
        self.input[(c * self.config.height + y as usize) * self.config.width + x as usize]
    }

    fn source(&self, oh: usize, ow: usize, kh: usize, kw: usize) -> (isize, isize) {
        let (stride, pad) = (self.config.stride as isize, self.config.pad as isize);
        (
            oh as isize * stride - pad + kh as isize,
            ow as isize * stride - pad + kw as isize,
        )
    }

    /// One row per `(channel, kh, kw)`, one column per output pixel.
    pub fn im2col(&self) -> Vec<Vec<i8>> {
        let ConvConfig {
            channels,
            kernel_h,
            kernel_w,
            ..
        } = self.config;
        let (out_h, out_w) = self.config.output_dims();
        let mut rows = Vec::with_capacity(self.config.patch_len());
        for c in 0..channels {
            for kh in 0..kernel_h {
                for kw in 0..kernel_w {
                    let row = (0..out_h * out_w)
                        .map(|p| {
                            let (y, x) = self.source(p / out_w, p % out_w, kh, kw);
                            self.pixel(c, y, x)
                        })
                        .collect();
                    rows.push(row);
                }
            }
        }
        rows
    }

    /// Direct convolution, `filters × pixels`.
    pub fn reference(&self) -> Vec<Vec<i32>> {
        let ConvConfig {
            channels,
            filters,
            kernel_h,
            kernel_w,
            ..
        } = self.config;
        let (out_h, out_w) = self.config.output_dims();
        let patch = self.config.patch_len();
        (0..filters)
            .map(|f| {
                (0..out_h * out_w)
                    .map(|p| {
                        let mut sum = 0i32;
                        for c in 0..channels {
                            for kh in 0..kernel_h {
                                for kw in 0..kernel_w {
                                    let (y, x) = self.source(p / out_w, p % out_w, kh, kw);
                                    let tap = (c * kernel_h + kh) * kernel_w + kw;
                                    let weight = self.kernels[f * patch + tap];
                                    sum += self.pixel(c, y, x) as i32 * weight as i32;
                                }
                            }
                        }
                        sum
                    })
                    .collect()
            })
            .collect()
    }

    /// The tiled multiply this convolution lowers to.
    pub fn lower(&self) -> anyhow::Result<TiledMatmul> {
        let (out_h, out_w) = self.config.output_dims();
        let patch = self.config.patch_len();
        let matmul_config = WorkloadConfig {
            m: round_up(self.config.filters),
            k: round_up(patch),
            n: round_up(out_h * out_w),
            seed: self.config.seed,
            staging_base: self.config.staging_base,
        };

        let a = (0..matmul_config.m)
            .map(|f| {
                let mut row = vec![0; matmul_config.k];
                if f < self.config.filters {
                    row[..patch].copy_from_slice(&self.kernels[f * patch..(f + 1) * patch]);
                }
                row
            })
            .collect();
        let mut b = self.im2col();
        b.iter_mut().for_each(|row| row.resize(matmul_config.n, 0));
        b.resize(matmul_config.k, vec![0; matmul_config.n]);
        TiledMatmul::with_inputs(matmul_config, a, b)
    }

    pub fn run(&self, fabric: &mut Fabric, timeout: Cycle) -> anyhow::Result<ConvReport> {
        let (out_h, out_w) = self.config.output_dims();
        let matmul = self.lower()?;
        info!(
            "conv2d {}x{}x{} with {} {}x{} filters: {}x{}x{} multiply",
            self.config.channels,
            self.config.height,
            self.config.width,
            self.config.filters,
            self.config.kernel_h,
            self.config.kernel_w,
            matmul.config().m,
            matmul.config().k,
            matmul.config().n
        );
        let (report, product) = matmul.run_with_output(fabric, timeout)?;

        let reference = self.reference();
        let mismatches = reference
            .iter()
            .zip(&product)
            .flat_map(|(want, got)| want.iter().zip(got))
            .filter(|(want, got)| want != got)
            .count();
        info!("conv2d finished, {} mismatches", mismatches);
        Ok(ConvReport {
            output_h: out_h,
            output_w: out_w,
            filters: self.config.filters,
            passed: report.passed && mismatches == 0,
            matmul: report,
            mismatches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_channel(height: usize, width: usize, pad: usize) -> ConvConfig {
        ConvConfig {
            height,
            width,
            channels: 1,
            filters: 1,
            pad,
            ..ConvConfig::default()
        }
    }

    #[test]
    fn im2col_zero_fills_the_border() {
        let input: Vec<i8> = (1..=9).collect();
        let conv = Conv2d::with_inputs(single_channel(3, 3, 1), input, vec![0; 9]).unwrap();
        let cols = conv.im2col();
        assert_eq!(9, cols.len());
        assert_eq!(9, cols[0].len());
        // top-left tap sees padding for the first output row and column
        assert_eq!(vec![0, 0, 0, 0, 1, 2, 0, 4, 5], cols[0]);
        // centre tap is the image itself
        assert_eq!((1..=9).collect::<Vec<i8>>(), cols[4]);
    }

    #[test]
    fn reference_sums_the_window() {
        let conv = Conv2d::with_inputs(single_channel(3, 3, 0), vec![2; 9], vec![-1; 9]).unwrap();
        assert_eq!(vec![vec![-18]], conv.reference());
    }

    #[test]
    fn lowering_pads_to_whole_tiles() {
        let conv = Conv2d::new(ConvConfig::default()).unwrap();
        let matmul = conv.lower().unwrap();
        let config = matmul.config();
        assert_eq!((4, 20, 64), (config.m, config.k, config.n));
        assert_eq!(5 * 16, matmul.num_jobs());

        let product = matmul.reference();
        let direct = conv.reference();
        for (f, row) in direct.iter().enumerate() {
            assert_eq!(row.as_slice(), &product[f][..row.len()]);
        }
    }

    #[test]
    fn inputs_of_the_wrong_size_are_rejected() {
        let config = single_channel(3, 3, 0);
        assert!(Conv2d::with_inputs(config.clone(), vec![0; 8], vec![0; 9]).is_err());
        assert!(Conv2d::with_inputs(config, vec![0; 9], vec![0; 10]).is_err());
    }
}
