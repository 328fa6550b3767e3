//! buddy CLI: check hyperparameter overrides and look into local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use expbuddy::overrides::kind_changes;
use expbuddy::{capture, logging, storage, Registry};

#[derive(Parser)]
#[command(
    name = "buddy",
    about = "expbuddy: hyperparameters, overrides and run tracking",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the hyperparameters of a YAML config after applying overrides
    Params {
        /// Flat YAML mapping of hyperparameters
        config: PathBuf,
        /// Print the merged set as YAML instead of a table
        #[arg(long)]
        yaml: bool,
        /// Overrides, e.g. `-- --lr=0.1 --^epochs=20`
        #[arg(last = true, allow_hyphen_values = true)]
        overrides: Vec<String>,
    },
    /// Inspect a local run: config, last metrics, histograms and figures
    Inspect {
        /// Path to the run directory (e.g. tensorboard/my_run/Jan01_12-00-00)
        run_dir: PathBuf,
    },
    /// Export the config and scalars of one or more local runs, e.g. a sweep
    Export {
        /// Run directories
        #[arg(required = true)]
        run_dirs: Vec<PathBuf>,
        /// Output format
        #[arg(long, short, default_value = "csv", value_parser = ["csv", "json"])]
        format: String,
    },
}

fn main() -> Result<()> {
    let _guard = logging::init(None);
    let cli = Cli::parse();

    match cli.command {
        Commands::Params {
            config,
            yaml,
            overrides,
        } => cmd_params(config, yaml, overrides),
        Commands::Inspect { run_dir } => cmd_inspect(run_dir),
        Commands::Export { run_dirs, format } => cmd_export(run_dirs, format),
    }
}

// ─── Command implementations ──────────────────────────────────────────────────

fn cmd_params(config: PathBuf, yaml: bool, overrides: Vec<String>) -> Result<()> {
    let declared = capture::from_yaml_file(&config)
        .with_context(|| format!("loading {}", config.display()))?;

    let mut registry = Registry::new();
    let merged = registry.register(declared.clone(), &overrides)?;

    if yaml {
        print!("{}", serde_yaml::to_string(&merged.to_yaml_mapping())?);
        return Ok(());
    }

    let changed = kind_changes(&declared, merged);
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Name", "Type", "Value", "Source"]);
    for (name, value) in merged.iter() {
        let source = if declared.get(name) == Some(value) {
            "config"
        } else {
            "override"
        };
        let kind = match changed.iter().find(|(k, _, _)| k == name) {
            Some((_, from, to)) => format!("{to} (was {from})"),
            None => value.kind().to_string(),
        };
        table.add_row(vec![name.to_string(), kind, value.to_string(), source.to_string()]);
    }
    println!("{}", table);
    Ok(())
}

fn cmd_inspect(run_dir: PathBuf) -> Result<()> {
    if !run_dir.exists() {
        anyhow::bail!("Run directory not found: {}", run_dir.display());
    }

    let meta = storage::load_run_metadata(&run_dir)?;
    println!("Run: {}", meta.name);
    println!("Project: {}", meta.project);
    println!("Status: {}", meta.status);
    println!("Started: {}", meta.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(d) = meta.duration_secs {
        println!("Duration: {:.1}s", d);
    }
    if let Some(step) = meta.last_step {
        println!("Last step: {}", step);
    }
    println!();

    let config = storage::load_config(&run_dir)?;
    if !config.is_empty() {
        println!("── Config ──────────────────────────────");
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Key", "Value"]);
        let mut entries: Vec<_> = config.iter().collect();
        entries.sort();
        for (k, v) in entries {
            table.add_row([k.as_str(), v.as_str()]);
        }
        println!("{}", table);
        println!();
    }

    let rows = storage::read_metrics(&run_dir.join(storage::METRICS_FILE))?;
    if let Some(last) = rows.last() {
        println!("── Last Metrics ({} total rows) ─────────", rows.len());
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Metric", "Value"]);
        let mut entries: Vec<_> = last.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in entries {
            table.add_row(vec![k.clone(), v.to_string()]);
        }
        println!("{}", table);
    }

    let histograms = storage::read_histograms(&run_dir.join(storage::HISTOGRAMS_FILE))?;
    if !histograms.is_empty() {
        println!("── Histograms ({}) ─────────────────────", histograms.len());
        for h in &histograms {
            println!("  {} @ {} ({} samples)", h.tag, h.step, h.histogram.total());
        }
    }

    let figures_dir = run_dir.join(storage::FIGURES_DIR);
    if figures_dir.is_dir() {
        let mut names: Vec<String> = std::fs::read_dir(&figures_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        println!("── Figures ({}) ────────────────────────", names.len());
        for name in names {
            println!("  {}", name);
        }
    }

    Ok(())
}

fn cmd_export(run_dirs: Vec<PathBuf>, format: String) -> Result<()> {
    let mut runs = Vec::with_capacity(run_dirs.len());
    for run_dir in &run_dirs {
        let metrics_path = run_dir.join(storage::METRICS_FILE);
        if !metrics_path.exists() {
            anyhow::bail!("No {} found in {}", storage::METRICS_FILE, run_dir.display());
        }
        let name = storage::load_run_metadata(run_dir)
            .with_context(|| format!("reading {}", run_dir.display()))?
            .name;
        let config: BTreeMap<String, String> = storage::load_config(run_dir)?.into_iter().collect();
        let scalars = storage::read_metrics(&metrics_path)?;
        runs.push(ExportedRun { name, config, scalars });
    }

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&runs)?),
        "csv" => print!("{}", sweep_csv(&runs)),
        _ => anyhow::bail!("Unknown format: {}", format),
    }
    Ok(())
}

#[derive(Serialize)]
struct ExportedRun {
    name: String,
    config: BTreeMap<String, String>,
    scalars: Vec<HashMap<String, serde_json::Value>>,
}

/// One line per logged row, prefixed by the run name and its config values.
fn sweep_csv(runs: &[ExportedRun]) -> String {
    let config_keys: BTreeSet<&String> = runs.iter().flat_map(|r| r.config.keys()).collect();
    let metric_keys: BTreeSet<&String> = runs
        .iter()
        .flat_map(|r| r.scalars.iter().flat_map(|row| row.keys()))
        .collect();

    let mut header = vec!["run".to_string()];
    header.extend(config_keys.iter().map(|k| csv_field(k)));
    header.extend(metric_keys.iter().map(|k| csv_field(k)));
    let mut out = header.join(",") + "\n";

    for run in runs {
        let mut prefix = vec![csv_field(&run.name)];
        prefix.extend(
            config_keys
                .iter()
                .map(|k| run.config.get(*k).map(|v| csv_field(v)).unwrap_or_default()),
        );
        for row in &run.scalars {
            let mut line = prefix.clone();
            line.extend(metric_keys.iter().map(|k| match row.get(*k) {
                Some(serde_json::Value::Null) | None => String::new(),
                Some(serde_json::Value::String(s)) => csv_field(s),
                Some(v) => v.to_string(),
            }));
            out += &(line.join(",") + "\n");
        }
    }
    out
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
