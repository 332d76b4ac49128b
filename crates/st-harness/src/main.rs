#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use st_harness::{
    inspect::{InspectOptions, inspect_image},
    load_config,
    scenario::{Scenario, run_scenario},
    stress::{StressConfig, run_stress},
};
use std::env;
use std::path::Path;
use std::sync::Arc;
use synctrack::{Device, DeviceConfig, IoEngine, PreadPwriteEngine};
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("scenario") => run_scenario_cmd(&args[1..]),
        Some("stress") => run_stress_cmd(&args[1..]),
        Some("inspect") => run_inspect_cmd(&args[1..]),
        Some("format") => run_format_cmd(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn value<'a>(args: &'a [String], index: usize, flag: &str) -> Result<&'a str> {
    args.get(index + 1)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires a value"))
}

fn run_scenario_cmd(args: &[String]) -> Result<()> {
    let name = args
        .first()
        .context("usage: st-harness scenario <a|b|c>")?;
    let report = run_scenario(name.parse()?)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!("scenario {} failed", report.scenario);
    }
    Ok(())
}

fn run_stress_cmd(args: &[String]) -> Result<()> {
    let mut config = StressConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = value(args, index, flag)?;
        match flag {
            "--threads" => config.threads = raw.parse().context("invalid --threads value")?,
            "--ops" => config.ops = raw.parse().context("invalid --ops value")?,
            "--seed" => config.seed = raw.parse().context("invalid --seed value")?,
            "--fault-ppm" => config.fault_ppm = raw.parse().context("invalid --fault-ppm value")?,
            "--capacity-sectors" => {
                config.capacity_sectors =
                    raw.parse().context("invalid --capacity-sectors value")?;
            }
            "--al-extents" => {
                config.al_extents = raw.parse().context("invalid --al-extents value")?;
            }
            other => bail!("unknown stress option: {other}"),
        }
        index += 2;
    }

    let report = run_stress(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!(
            "stress run found {} exclusion and {} accounting violation(s)",
            report.exclusion_violations,
            report.accounting_violations
        );
    }
    Ok(())
}

fn run_inspect_cmd(args: &[String]) -> Result<()> {
    let image = args
        .first()
        .context("usage: st-harness inspect <image> [--al-offset S] [--slots N]")?;
    let mut options = InspectOptions::default();
    let mut index = 1_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = value(args, index, flag)?;
        match flag {
            "--al-offset" => {
                options.al_offset_sectors = raw.parse().context("invalid --al-offset value")?;
            }
            "--slots" => options.slots = raw.parse().context("invalid --slots value")?,
            other => bail!("unknown inspect option: {other}"),
        }
        index += 2;
    }

    let report = inspect_image(Path::new(image), &options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_format_cmd(args: &[String]) -> Result<()> {
    let image = args
        .first()
        .context("usage: st-harness format <image> [--config FILE] [--capacity-sectors N]")?;
    let mut config = DeviceConfig::default();
    let mut index = 1_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = value(args, index, flag)?;
        match flag {
            "--config" => config = load_config(Path::new(raw))?,
            "--capacity-sectors" => {
                config.capacity_sectors =
                    raw.parse().context("invalid --capacity-sectors value")?;
            }
            other => bail!("unknown format option: {other}"),
        }
        index += 2;
    }

    let path = Path::new(image);
    let len = config.layout().required_bytes();
    let engine: Arc<dyn IoEngine> = Arc::new(
        PreadPwriteEngine::create(path, len)
            .with_context(|| format!("failed to create {}", path.display()))?,
    );
    Device::format(&config, engine)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "image": path.display().to_string(),
            "bytes": len,
            "ring_slots": config.ring_slots(),
            "layout": config.layout(),
        }))?
    );
    Ok(())
}

fn print_usage() {
    println!("st-harness: synctrack scenarios, stress runs and ring inspection");
    println!();
    println!("USAGE:");
    println!("  st-harness scenario <a|b|c>");
    println!(
        "  st-harness stress [--threads N] [--ops N] [--seed S] [--fault-ppm P] [--capacity-sectors N] [--al-extents N]"
    );
    println!("  st-harness inspect <image> [--al-offset S] [--slots N]");
    println!("  st-harness format <image> [--config FILE] [--capacity-sectors N]");
    println!();
    println!("SCENARIOS:");
    println!("  a  bitmap weight bookkeeping on a 1024-bit bitmap");
    println!("  b  ten distinct extents through a seven-slot activity log");
    println!("  c  replay of a wrapped ring holding a stale lap");
    println!();
    println!("STRESS:");
    println!("  Concurrent writers and a resync driver on an in-memory device. The");
    println!("  activity-log/resync exclusion and the rs_failed bound are audited");
    println!("  throughout; --fault-ppm injects metadata write failures.");
    println!();
    println!("Set RUST_LOG (e.g. RUST_LOG=synctrack=debug) for tracing output on stderr.");
}
