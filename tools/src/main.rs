//! cohort-runner: generates a synthetic cohort into per-category CSV files.
//!
//! Usage:
//!   cohort-runner --config ./config.json --out-dir ./out
//!   cohort-runner --config ./config.json --seed 7 --n 100000 --today 2024-06-01

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use cohort_core::{
    clock::ObservationClock, sink::CsvSinkFactory, Category, CohortConfig, ConfigFile,
    Orchestrator, RunSummary,
};
use std::{env, path::PathBuf, sync::Arc};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = flag_value(&args, "--config").unwrap_or("./config.json");
    let out_dir = PathBuf::from(flag_value(&args, "--out-dir").unwrap_or("."));

    let mut file = ConfigFile::load(config_path)
        .with_context(|| format!("error loading configuration file {config_path}"))?;
    if let Some(seed) = parse_flag::<u64>(&args, "--seed")? {
        file.seed = seed;
    }
    if let Some(n) = parse_flag::<usize>(&args, "--n")? {
        file.n = n;
    }
    if let Some(buffer) = parse_flag::<usize>(&args, "--buffer")? {
        file.buffer_size = buffer;
    }
    let clock = match flag_value(&args, "--today") {
        Some(s) => ObservationClock::fixed(
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("--today '{s}' is not a YYYY-MM-DD date"))?,
        ),
        None => ObservationClock::system(),
    };

    let config = CohortConfig::validate(file, clock).context("invalid configuration")?;

    println!("cohort-runner");
    println!("  config:    {config_path}");
    println!("  out_dir:   {}", out_dir.display());
    println!("  n:         {}", config.n());
    println!("  seed:      {}", config.seed());
    println!();

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("cannot create output directory {}", out_dir.display()))?;
    let sinks = Arc::new(CsvSinkFactory::new(&out_dir));
    let mut orchestrator = Orchestrator::new(config, sinks);
    let summary = orchestrator.run().await?;

    print_summary(&summary);
    let summary_path = out_dir.join("run_summary.json");
    summary
        .write_json(&summary_path)
        .with_context(|| format!("cannot write {}", summary_path.display()))?;
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let elapsed = summary.finished_at - summary.started_at;
    println!("=== RUN SUMMARY ===");
    println!("  run_id:    {}", summary.run_id);
    println!("  members:   {}", summary.members);
    for category in Category::ALL {
        println!("  {:<9}  {}", format!("{category}:"), summary.written(category));
    }
    println!("  elapsed:   {:.2}s", elapsed.num_milliseconds() as f64 / 1000.0);
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>> {
    match flag_value(args, flag) {
        None => Ok(None),
        Some(raw) => match raw.parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => bail!("{flag} expects a number, got '{raw}'"),
        },
    }
}
