use anyhow::{Context, Result};
use clap::Parser;

use reducr::runtime::create_runtime;
use reducr::{DriverParams, RuntimeKind, SgdSolver, TrainConfig};

/// reducr: tree-based synchronous multi-GPU training
#[derive(Parser, Debug)]
#[command(name = "reducr")]
#[command(about = "Tree-based synchronous data-parallel training", long_about = None)]
struct Args {
    /// Path to the configuration YAML file
    #[arg(short = 'f', long = "config")]
    config_file: Option<String>,

    /// Device IDs to train on (e.g., "0,1,2,3"); the first is the root
    #[arg(long = "gpus")]
    gpus: Option<String>,

    /// Accelerator runtime backend: "host" or "cuda"
    #[arg(long = "runtime")]
    runtime: Option<String>,

    /// Override max training iterations
    #[arg(long = "iters")]
    max_iter: Option<usize>,

    /// Base random seed (replica i trains with seed + device id)
    #[arg(long = "seed")]
    seed: Option<u64>,

    /// Headless mode: print a final JSON metrics line instead of logs
    #[arg(long)]
    headless: bool,
}

/// Parse device IDs from a comma-separated string (e.g., "0,1,2,3")
fn parse_gpu_ids(gpus: &str) -> Vec<i32> {
    gpus.split(',')
        .filter_map(|id| id.trim().parse::<i32>().ok())
        .collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config_file {
        Some(path) => TrainConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => TrainConfig::default(),
    };
    if let Some(iters) = args.max_iter {
        config.solver.max_iter = iters;
    }
    if let Some(seed) = args.seed {
        config.solver.random_seed = Some(seed);
    }

    let devices = match &args.gpus {
        Some(s) => parse_gpu_ids(s),
        None => config.parallel.devices(),
    };
    let kind: RuntimeKind = match &args.runtime {
        Some(s) => s.parse().map_err(anyhow::Error::msg)?,
        None => config.parallel.runtime,
    };

    // The host backend emulates enough devices to cover the requested ids.
    let emulated = devices.iter().copied().max().unwrap_or(0).max(0) as usize + 1;
    let runtime = create_runtime(kind, emulated)?;

    let driver_params = DriverParams {
        device_id: *devices.first().unwrap_or(&0),
        max_iter: config.solver.max_iter,
        random_seed: config.solver.random_seed,
    };
    let mut solver = SgdSolver::new(runtime.clone(), config.solver.clone(), driver_params);

    if devices.len() > 1 {
        log::info!("training on devices {:?} ({} runtime)", devices, kind);
        reducr::run(runtime, &mut solver, &devices)?;
    } else {
        log::info!("training on a single device ({} runtime)", kind);
        use reducr::Driver;
        solver.solve()?;
    }

    let loss = solver.evaluate()?;
    if args.headless {
        println!(
            "{}",
            serde_json::json!({
                "devices": devices.len(),
                "iterations": config.solver.max_iter,
                "runtime": kind.to_string(),
                "loss": loss,
            })
        );
    } else {
        log::info!("final loss {:.6}", loss);
    }
    Ok(())
}
