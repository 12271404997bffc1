use anyhow::{bail, ensure};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::base::behavior::ModuleBehaviors;
use crate::compute::unit::{pack_row, STORE_WORDS};
use crate::compute::{Operands, DIM};
use crate::fabric::config::RegionKind;
use crate::fabric::types::{Addr, Word, WORD_BYTES};
use crate::sim::top::Fabric;
use crate::timeq::Cycle;
use crate::workload::config::WorkloadConfig;

type Tile = [[i8; DIM]; DIM];

const TILE_IN_BYTES: u64 = (DIM * DIM) as u64;
const TILE_OUT_BYTES: u64 = STORE_WORDS as u64 * WORD_BYTES as u64;

/// One tile product `A[ti][tk] · B[tk][tj]`, accumulated into `C[ti][tj]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Job {
    ti: usize,
    tj: usize,
    tk: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub jobs: usize,
    pub cycles: Cycle,
    pub mismatches: usize,
    /// Value the scalar core left in the progress register.
    pub progress: Word,
    pub passed: bool,
}

/// Placement of operand tiles and per-unit result slots, as byte offsets into main memory.
/// Offsets are 64-bit so oversized workloads are reported rather than wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    base: u64,
    a_cols: u64,
    a_tiles: u64,
    b_cols: u64,
    b_tiles: u64,
}

impl Layout {
    fn new(config: &WorkloadConfig) -> Self {
        let (m, k, n) = (config.m as u64, config.k as u64, config.n as u64);
        let dim = DIM as u64;
        Self {
            base: config.staging_base as u64,
            a_cols: k / dim,
            a_tiles: (m / dim) * (k / dim),
            b_cols: n / dim,
            b_tiles: (k / dim) * (n / dim),
        }
    }

    fn a_tile(&self, ti: usize, tk: usize) -> u64 {
        self.base + (ti as u64 * self.a_cols + tk as u64) * TILE_IN_BYTES
    }

    fn b_base(&self) -> u64 {
        self.base + self.a_tiles * TILE_IN_BYTES
    }

    fn b_tile(&self, tk: usize, tj: usize) -> u64 {
        self.b_base() + (tk as u64 * self.b_cols + tj as u64) * TILE_IN_BYTES
    }

    fn c_slot(&self, unit: usize) -> u64 {
        self.b_base() + self.b_tiles * TILE_IN_BYTES + unit as u64 * TILE_OUT_BYTES
    }

    /// Bytes of main memory needed with `units` result slots.
    fn end(&self, units: usize) -> u64 {
        self.c_slot(units)
    }
}

/// Host-side driver for a tiled matrix multiply on the compute array.
///
/// Operand tiles are staged once in main memory; each unit owns a private result tile slot
/// that the driver reads back at the unit's done pulse. Jobs go to free units in round-robin
/// order, and the scalar core posts a running tile count to the diagnostic region.
pub struct TiledMatmul {
    config: WorkloadConfig,
    layout: Layout,
    a: Vec<Vec<i8>>,
    b: Vec<Vec<i8>>,
    jobs: Vec<Job>,
}

impl TiledMatmul {
    pub fn new(config: WorkloadConfig) -> anyhow::Result<Self> {
        config.ensure_valid()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let a = (0..config.m)
            .map(|_| (0..config.k).map(|_| rng.gen::<i8>()).collect())
            .collect();
        let b = (0..config.k)
            .map(|_| (0..config.n).map(|_| rng.gen::<i8>()).collect())
            .collect();
        Self::with_inputs(config, a, b)
    }

    /// Multiply caller-supplied `a` (`m`×`k`) and `b` (`k`×`n`).
    pub fn with_inputs(config: WorkloadConfig, a: Vec<Vec<i8>>, b: Vec<Vec<i8>>) -> anyhow::Result<Self> {
        config.ensure_valid()?;
        Self::check_shape("a", &a, config.m, config.k)?;
        Self::check_shape("b", &b, config.k, config.n)?;
        let mut jobs = Vec::with_capacity(config.num_jobs());
        for ti in 0..config.m / DIM {
            for tj in 0..config.n / DIM {
                for tk in 0..config.k / DIM {
                    jobs.push(Job { ti, tj, tk });
                }
            }
        }
        Ok(Self {
            layout: Layout::new(&config),
            config,
            a,
            b,
            jobs,
        })
    }

    fn check_shape(name: &str, matrix: &[Vec<i8>], rows: usize, cols: usize) -> anyhow::Result<()> {
        ensure!(
            matrix.len() == rows,
            "matrix {} has {} rows, expected {}",
            name,
            matrix.len(),
            rows
        );
        if let Some((r, row)) = matrix.iter().enumerate().find(|(_, row)| row.len() != cols) {
            bail!("matrix {} row {} has {} columns, expected {}", name, r, row.len(), cols);
        }
        Ok(())
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    fn a_tiles(&self) -> (usize, usize) {
        (self.config.m / DIM, self.config.k / DIM)
    }

    fn b_tiles(&self) -> (usize, usize) {
        (self.config.k / DIM, self.config.n / DIM)
    }

    fn tile(matrix: &[Vec<i8>], row: usize, col: usize) -> Tile {
        let mut tile = [[0; DIM]; DIM];
        for (r, out) in tile.iter_mut().enumerate() {
            for (c, v) in out.iter_mut().enumerate() {
                *v = matrix[row * DIM + r][col * DIM + c];
            }
        }
        tile
    }

    /// Stage every operand tile in main memory through the backdoor.
    fn stage(&self, fabric: &mut Fabric) -> anyhow::Result<()> {
        let Some(main) = fabric.config().memory_region().cloned() else {
            bail!("no memory region to stage operands in");
        };
        let end = self.layout.end(fabric.array().len());
        ensure!(
            end <= main.size as u64,
            "workload needs {:#x} bytes of main memory, region '{}' has {:#x}",
            end,
            main.name,
            main.size
        );

        let (rows, cols) = self.a_tiles();
        for ti in 0..rows {
            for tk in 0..cols {
                let words: Vec<Word> = Self::tile(&self.a, ti, tk).iter().map(pack_row).collect();
                fabric.poke_words(main.base + self.layout.a_tile(ti, tk) as Addr, &words)?;
            }
        }
        let (rows, cols) = self.b_tiles();
        for tk in 0..rows {
            for tj in 0..cols {
                let words: Vec<Word> = Self::tile(&self.b, tk, tj).iter().map(pack_row).collect();
                fabric.poke_words(main.base + self.layout.b_tile(tk, tj) as Addr, &words)?;
            }
        }
        Ok(())
    }

    pub fn reference(&self) -> Vec<Vec<i32>> {
        let mut c = vec![vec![0i32; self.config.n]; self.config.m];
        for (i, row) in c.iter_mut().enumerate() {
            for (j, out) in row.iter_mut().enumerate() {
                *out = (0..self.config.k)
                    .map(|k| self.a[i][k] as i32 * self.b[k][j] as i32)
                    .sum();
            }
        }
        c
    }

    /// Run every job to completion on `fabric`, giving up after `timeout` cycles.
    pub fn run(&self, fabric: &mut Fabric, timeout: Cycle) -> anyhow::Result<WorkloadReport> {
        self.run_with_output(fabric, timeout).map(|(report, _)| report)
    }

    /// As [`TiledMatmul::run`], also returning the product assembled from the units' tiles.
    pub fn run_with_output(
        &self,
        fabric: &mut Fabric,
        timeout: Cycle,
    ) -> anyhow::Result<(WorkloadReport, Vec<Vec<i32>>)> {
        ensure!(fabric.quiescent(), "fabric must be idle before a workload starts");
        self.stage(fabric)?;
        let main_base = fabric.config().memory_region().map(|r| r.base).unwrap_or(0);
        // offsets were checked against the region size in `stage`
        let addr = |offset: u64| main_base + offset as Addr;
        let progress_addr = fabric
            .config()
            .regions
            .iter()
            .find(|r| r.kind == RegionKind::Registers && r.name == "diag")
            .map(|r| r.base);

        let num_units = fabric.array().len();
        let mut running: Vec<Option<Job>> = vec![None; num_units];
        let mut result = vec![vec![0i32; self.config.n]; self.config.m];
        let mut next_job = 0;
        let mut next_unit = 0;
        let mut finished: Word = 0;
        let start = fabric.cycle();

        info!(
            "tiled matmul {}x{}x{}: {} tile jobs on {} units",
            self.config.m,
            self.config.k,
            self.config.n,
            self.jobs.len(),
            num_units
        );

        while finished as usize != self.jobs.len() || !fabric.quiescent() {
            if fabric.cycle() - start >= timeout {
                bail!(
                    "workload timed out after {} cycles with {}/{} tiles done",
                    timeout,
                    finished,
                    self.jobs.len()
                );
            }

            // dispatch round-robin onto free units
            for _ in 0..num_units {
                if next_job == self.jobs.len() {
                    break;
                }
                let unit = next_unit;
                next_unit = (next_unit + 1) % num_units;
                if running[unit].is_some() || !fabric.array().available(unit) {
                    continue;
                }
                let job = self.jobs[next_job];
                let operands = Operands {
                    a: addr(self.layout.a_tile(job.ti, job.tk)),
                    b: addr(self.layout.b_tile(job.tk, job.tj)),
                    c: addr(self.layout.c_slot(unit)),
                };
                fabric.array_mut().launch(unit, operands)?;
                running[unit] = Some(job);
                next_job += 1;
            }

            fabric.tick_one();

            let done: Vec<usize> = fabric.array().done_units().collect();
            for unit in done {
                let Some(job) = running[unit].take() else { continue };
                if fabric.array().unit(unit).error() {
                    bail!("unit {} faulted on tile ({}, {}, {})", unit, job.ti, job.tj, job.tk);
                }
                let words = fabric.peek_words(addr(self.layout.c_slot(unit)), STORE_WORDS)?;
                for (idx, word) in words.into_iter().enumerate() {
                    let (r, c) = (idx / DIM, idx % DIM);
                    result[job.ti * DIM + r][job.tj * DIM + c] += word as i32;
                }
                finished += 1;
                if let Some(addr) = progress_addr {
                    fabric.cpu_mut().push_write(addr, finished);
                }
            }
        }

        let cycles = fabric.cycle() - start;
        let reference = self.reference();
        let mismatches = result
            .iter()
            .flatten()
            .zip(reference.iter().flatten())
            .filter(|(got, want)| got != want)
            .count();
        let progress = match progress_addr {
            Some(addr) => fabric.peek_word(addr)?,
            None => finished,
        };
        info!(
            "tiled matmul finished in {} cycles, {} mismatches",
            cycles, mismatches
        );

        let report = WorkloadReport {
            m: self.config.m,
            k: self.config.k,
            n: self.config.n,
            jobs: self.jobs.len(),
            cycles,
            mismatches,
            progress,
            passed: mismatches == 0 && progress as usize == self.jobs.len(),
        };
        Ok((report, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_extracts_row_major_block() {
        let config = WorkloadConfig {
            m: 8,
            k: 8,
            n: 4,
            ..WorkloadConfig::default()
        };
        let a: Vec<Vec<i8>> = (0..8).map(|r| (0..8).map(|c| (r * 8 + c) as i8).collect()).collect();
        let b = vec![vec![0; 4]; 8];
        let matmul = TiledMatmul::with_inputs(config, a.clone(), b).unwrap();
        let tile = TiledMatmul::tile(&a, 1, 1);
        assert_eq!([36, 37, 38, 39], tile[0]);
        assert_eq!([60, 61, 62, 63], tile[3]);
        assert_eq!(2 * 2, matmul.num_jobs());
    }

    #[test]
    fn staging_layout_does_not_overlap() {
        let layout = Layout::new(&WorkloadConfig::default());
        let last_a = layout.a_tile(3, 3);
        assert!(last_a + TILE_IN_BYTES <= layout.b_base());
        let last_b = layout.b_tile(3, 3);
        assert!(last_b + TILE_IN_BYTES <= layout.c_slot(0));
        assert_eq!(TILE_OUT_BYTES, layout.c_slot(1) - layout.c_slot(0));
    }

    #[test]
    fn oversized_layout_is_measured_past_four_gigabytes() {
        let config = WorkloadConfig {
            m: 1 << 18,
            k: 1 << 18,
            n: 4,
            ..WorkloadConfig::default()
        };
        let layout = Layout::new(&config);
        // A alone is 64 GiB of tiles
        assert!(layout.b_base() > 1 << 32);
        assert!(layout.end(8) > layout.b_base());
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let config = WorkloadConfig {
            m: 4,
            k: 8,
            n: 4,
            ..WorkloadConfig::default()
        };
        let short_row = vec![vec![0; 8], vec![0; 8], vec![0; 7], vec![0; 8]];
        let err = TiledMatmul::with_inputs(config.clone(), short_row, vec![vec![0; 4]; 8])
            .err()
            .unwrap();
        assert!(err.to_string().contains("matrix a row 2"), "{err}");
        assert!(TiledMatmul::with_inputs(config.clone(), vec![vec![0; 8]; 4], vec![vec![0; 4]; 4]).is_err());
        TiledMatmul::with_inputs(config, vec![vec![0; 8]; 4], vec![vec![0; 4]; 8]).unwrap();
    }

    #[test]
    fn reference_matches_hand_computation() {
        let config = WorkloadConfig {
            m: 4,
            k: 4,
            n: 4,
            ..WorkloadConfig::default()
        };
        let a = vec![vec![1, 2, 3, 4]; 4];
        let b = vec![vec![-1; 4]; 4];
        let matmul = TiledMatmul::with_inputs(config, a, b).unwrap();
        assert!(matmul.reference().iter().flatten().all(|&v| v == -10));
    }
}
