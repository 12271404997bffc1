use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use toml::Table;
use unifabric::fabric::config::FabricConfig;
use unifabric::memctrl::CacheConfig;
use unifabric::sim::config::{Config, SimConfig};
use unifabric::sim::top::Fabric;
use unifabric::workload::{Conv2d, ConvConfig, TiledMatmul, WorkloadConfig};

#[derive(Parser)]
#[command(version, about)]
struct FabricArgs {
    #[arg(help = "Path to config.toml")]
    config_path: Option<PathBuf>,
    #[arg(long, help = "Override number of compute units")]
    units: Option<usize>,
    #[arg(long, help = "Override number of cache sets")]
    sets: Option<usize>,
    #[arg(long, help = "Override cache associativity")]
    ways: Option<usize>,
    #[arg(long, help = "Override backing store latency in cycles")]
    latency: Option<u64>,
    #[arg(long, help = "Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
    #[arg(long, help = "Give up after this many cycles")]
    timeout: Option<u64>,
    #[arg(long, help = "Write a CSV row per crossbar grant to this file")]
    trace: Option<PathBuf>,
    #[arg(long, help = "Write final statistics as JSON to this file")]
    stats_json: Option<PathBuf>,
    #[arg(long, help = "Run the [conv] convolution instead of the [workload] matmul")]
    conv: bool,
}

fn run(argv: FabricArgs) -> anyhow::Result<bool> {
    let config_table: Table = match &argv.config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).context("cannot parse config toml")?
        }
        None => Table::new(),
    };
    let mut sim_config = SimConfig::from_section(config_table.get("sim"))?;
    let mut cache_config = CacheConfig::from_section(config_table.get("cache"))?;
    let mut fabric_config = FabricConfig::from_section(config_table.get("fabric"))?;
    let workload_config = WorkloadConfig::from_section(config_table.get("workload"))?;
    let conv_config = ConvConfig::from_section(config_table.get("conv"))?;

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.timeout = argv.timeout.unwrap_or(sim_config.timeout);
    sim_config.trace = argv.trace.or(sim_config.trace);
    sim_config.stats_json = argv.stats_json.or(sim_config.stats_json);
    cache_config.sets = argv.sets.unwrap_or(cache_config.sets);
    cache_config.ways = argv.ways.unwrap_or(cache_config.ways);
    cache_config.backing_latency = argv.latency.unwrap_or(cache_config.backing_latency);
    fabric_config.num_units = argv.units.unwrap_or(fabric_config.num_units);

    let mut fabric = Fabric::new(Arc::new(fabric_config), Arc::new(cache_config), &sim_config)?;
    let passed = if argv.conv {
        let report = Conv2d::new(conv_config)?.run(&mut fabric, sim_config.timeout)?;
        println!(
            "conv2d {} filters -> {}x{}: {} tiles in {} cycles, {}",
            report.filters,
            report.output_h,
            report.output_w,
            report.matmul.jobs,
            report.matmul.cycles,
            if report.passed { "PASSED" } else { "FAILED" }
        );
        report.passed
    } else {
        let report = TiledMatmul::new(workload_config)?.run(&mut fabric, sim_config.timeout)?;
        println!(
            "matmul {}x{}x{}: {} tiles in {} cycles, {}",
            report.m,
            report.k,
            report.n,
            report.jobs,
            report.cycles,
            if report.passed { "PASSED" } else { "FAILED" }
        );
        report.passed
    };
    fabric.flush()?;

    let stats = fabric.stats();
    println!(
        "cache: {} accesses, {:.1}% hits, {} write-backs; cpu grants {}",
        stats.cache.accesses(),
        100.0 * stats.hit_rate,
        stats.cache.writebacks(),
        stats.cpu_grants
    );
    for unit in &stats.units {
        println!(
            "  unit {}: {} activations, {} grants",
            unit.unit, unit.activations, unit.grants
        );
    }

    if let Some(path) = &sim_config.stats_json {
        stats.write_json(path)?;
        info!("wrote stats to {}", path.display());
    }
    Ok(passed)
}

pub fn main() -> ExitCode {
    env_logger::init();
    match run(FabricArgs::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
