use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use sheetgate::{BackendError, GateConfig, GateError, IntentOutcome, SheetGate};
use sheetgate_testkit::{InMemorySheets, MemorySnapshots};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod script;

use script::{Script, Step, StepReport};

#[derive(Parser, Debug)]
#[command(name = "sheetgate", about = "Replay intents through sheetgate against an in-memory backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a JSON script and print every outcome plus final stats as JSON.
    Replay(ReplayArgs),
    /// Print a configuration preset as YAML.
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Script file (JSON).
    script: PathBuf,

    /// Configuration file (YAML or JSON). Overrides the script's own config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pretty-print the report.
    #[arg(long)]
    pretty: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Default,
    Interactive,
    Bulk,
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    #[arg(value_enum, default_value = "default")]
    preset: Preset,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start runtime")?;
            runtime.block_on(replay(args))
        }
        Command::Config(args) => {
            let config = match args.preset {
                Preset::Default => GateConfig::default(),
                Preset::Interactive => GateConfig::interactive(),
                Preset::Bulk => GateConfig::bulk(),
            };
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: &PathBuf) -> Result<GateConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = if path.extension().is_some_and(|e| e == "json") {
        GateConfig::from_json_str(&text)
    } else {
        GateConfig::from_yaml_str(&text)
    };
    config.with_context(|| format!("invalid config in {}", path.display()))
}

async fn replay(args: ReplayArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))?;
    let script: Script = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", args.script.display()))?;
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => script.config.clone().unwrap_or_default(),
    };

    let sheets = InMemorySheets::new();
    for object in &script.objects {
        sheets.insert(object.build());
    }
    let snapshots = MemorySnapshots::new(sheets.clone());
    let gate = SheetGate::new(Arc::new(sheets.clone()), Arc::new(snapshots), config)?;

    let mut reports = Vec::with_capacity(script.steps.len());
    for (step, action) in script.steps.into_iter().enumerate() {
        let calls_before = sheets.call_count();
        let (kind, results) = match action {
            Step::Submit(intents) => {
                tracing::info!(step, intents = intents.len(), "submit");
                let results = gate.submit_all(intents).await;
                ("submit", results.iter().map(outcome_json).collect())
            }
            Step::Transaction {
                object_id,
                intents,
                fail_after_mutations,
            } => {
                tracing::info!(step, object_id = object_id.as_str(), "transaction");
                if let Some(skip) = fail_after_mutations {
                    sheets.fail_mutation_after(
                        skip,
                        BackendError::Unavailable("injected by script".into()),
                    );
                }
                let result = run_transaction(&gate, &object_id, intents).await;
                sheets.clear_faults();
                ("transaction", vec![result])
            }
            Step::Throttle {
                count,
                retry_after_ms,
            } => {
                sheets.throttle_next(count, retry_after_ms.map(Duration::from_millis));
                ("throttle", Vec::new())
            }
            Step::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ("sleep", Vec::new())
            }
        };
        reports.push(StepReport {
            step,
            kind,
            results,
            backend_calls: sheets.call_count() - calls_before,
        });
    }

    gate.shutdown().await;
    let report = json!({
        "steps": reports,
        "stats": {
            "cache": gate.cache_stats(),
            "rate_limiter": gate.rate_limiter_stats(),
            "dedup": gate.dedup_stats(),
            "requests_sent": gate.requests_sent(),
            "windows_flushed": gate.windows_flushed(),
        },
    });
    let out = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{out}");
    Ok(())
}

async fn run_transaction(
    gate: &SheetGate,
    object_id: &str,
    intents: Vec<sheetgate::Intent>,
) -> serde_json::Value {
    let id = match gate.begin(object_id).await {
        Ok(id) => id,
        Err(e) => return error_json(&e),
    };
    for intent in intents {
        if let Err(e) = gate.queue(id, intent) {
            return error_json(&e);
        }
    }
    let result = gate.commit(id).await;
    let status = gate.transaction_status(id);
    match result {
        Ok(outcomes) => json!({
            "transaction": id.to_string(),
            "status": status,
            "outcomes": outcomes,
        }),
        Err(e) => json!({
            "transaction": id.to_string(),
            "status": status,
            "error": e.to_string(),
        }),
    }
}

fn outcome_json(result: &Result<IntentOutcome, GateError>) -> serde_json::Value {
    match result {
        Ok(outcome) => serde_json::to_value(outcome).unwrap_or_else(|e| json!({ "error": e.to_string() })),
        Err(e) => error_json(e),
    }
}

fn error_json(e: &GateError) -> serde_json::Value {
    json!({ "error": e.to_string(), "retryable": e.is_retryable() })
}
