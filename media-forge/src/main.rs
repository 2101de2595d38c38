use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use media_forge::app::App;
use media_forge::config::AppConfig;
use media_forge::domain::{JobStatus, MediaRef, PipelineKind, Priority};
use media_forge::logging::{self, panic_hook};
use media_forge::service::{CancelAck, JobStatusView, SubmitRequest};
use media_forge::store::JobFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Serve,
    /// Queue a job
    Submit {
        /// Pipeline kind, e.g. face-swap
        pipeline: String,
        /// Input files; the first one is the primary input
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Pipeline parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Show the status of a job
    Status { id: String },
    /// Cancel a job
    Cancel { id: String },
    /// List jobs
    List {
        /// Only jobs in this status (repeatable)
        #[arg(long)]
        status: Vec<String>,
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Resubmit a finished job with the same inputs
    Retry { id: String },
    /// Remove the intermediates of a finished job
    Purge {
        id: String,
        /// Also delete the promoted final output
        #[arg(long)]
        output: bool,
    },
    /// Show a job's execution log
    Logs { id: String },
    /// Print the pipeline catalog
    Pipelines,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let log_guard = if matches!(args.command, Command::Serve) {
        let (logging_config, guard) =
            logging::init_logging(&config.logging.log_dir, config.logging.json_file)?;
        panic_hook::install(logging_config.log_dir());
        if let Some(directive) = &config.logging.filter {
            logging_config.set_filter(directive)?;
        }
        Some((logging_config, guard))
    } else {
        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "media_forge=warn,sqlx=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        None
    };

    let app = App::init(config).await.context("Failed to initialize")?;

    match args.command {
        Command::Serve => {
            let shutdown = CancellationToken::new();
            if let Some((logging_config, _)) = &log_guard {
                logging_config.start_retention_cleanup(shutdown.clone());
            }

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                }
                signal_token.cancel();
            });

            app.serve(shutdown).await?;
        }
        Command::Submit {
            pipeline,
            inputs,
            priority,
            params,
        } => {
            let pipeline = PipelineKind::from_str(&pipeline)
                .with_context(|| format!("Unknown pipeline '{}'", pipeline))?;
            let priority = Priority::from_str(&priority).map_err(anyhow::Error::msg)?;
            let inputs = inputs
                .into_iter()
                .map(|path| {
                    MediaRef::infer(&path).with_context(|| {
                        format!("Cannot infer the media kind of {}", path.display())
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let request = SubmitRequest::new(pipeline, inputs)
                .with_priority(priority)
                .with_params(parse_params(&params)?);
            let id = app.service.submit(request).await?;
            if args.json {
                println!("{}", serde_json::json!({ "id": id }));
            } else {
                println!("{}", id);
            }
        }
        Command::Status { id } => {
            let view = app.service.get_status(&id).await?;
            print_views(&[view], args.json)?;
        }
        Command::Cancel { id } => {
            let ack = app.service.cancel(&id).await?;
            if args.json {
                println!("{}", serde_json::to_string(&ack)?);
            } else {
                match ack {
                    CancelAck::Cancelled => println!("{} cancelled", id),
                    CancelAck::CancelRequested => {
                        println!("{} cancellation requested; it stops at the next stage boundary", id)
                    }
                    CancelAck::AlreadyTerminal(status) => println!("{} is already {}", id, status),
                }
            }
        }
        Command::List { status, pipeline } => {
            let mut filter = JobFilter::new();
            for s in status {
                let Some(parsed) = JobStatus::parse(&s) else {
                    bail!("Unknown status '{}'", s);
                };
                filter = filter.with_status(parsed);
            }
            if let Some(pipeline) = pipeline {
                let kind = PipelineKind::from_str(&pipeline)
                    .with_context(|| format!("Unknown pipeline '{}'", pipeline))?;
                filter = filter.with_pipeline(kind);
            }
            let views = app.service.list(filter).await?;
            print_views(&views, args.json)?;
        }
        Command::Retry { id } => {
            let new_id = app.service.retry(&id).await?;
            if args.json {
                println!("{}", serde_json::json!({ "id": new_id, "retry_of": id }));
            } else {
                println!("{}", new_id);
            }
        }
        Command::Purge { id, output } => {
            let report = app.service.purge(&id).await?;
            let output_removed = if output {
                app.service.purge_output(&id).await?
            } else {
                false
            };
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "removed_entries": report.removed_entries,
                        "output_removed": output_removed,
                    })
                );
            } else {
                println!("removed {} intermediate entries", report.removed_entries);
                if output {
                    println!(
                        "final output {}",
                        if output_removed { "removed" } else { "already gone" }
                    );
                }
            }
        }
        Command::Logs { id } => {
            let logs = app.service.logs(&id).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                for entry in logs {
                    let at = chrono::DateTime::from_timestamp_millis(entry.created_at)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    println!("{} {:5} {}", at, entry.level.to_uppercase(), entry.message);
                }
            }
        }
        Command::Pipelines => {
            if args.json {
                let catalog: Vec<_> = app
                    .registry
                    .definitions()
                    .map(|def| {
                        serde_json::json!({
                            "pipeline": def.kind(),
                            "stages": def.stages().iter().map(|s| serde_json::json!({
                                "name": s.name(),
                                "resource_class": s.resource_class(),
                                "input_kinds": s.input_kinds(),
                                "output_kind": s.output_kind(),
                            })).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&catalog)?);
            } else {
                for def in app.registry.definitions() {
                    println!("{}", def.kind());
                    for (i, stage) in def.stages().iter().enumerate() {
                        println!(
                            "  {}. {:<10} {:<13} -> {}",
                            i + 1,
                            stage.name(),
                            stage.resource_class(),
                            stage.output_kind()
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_params(params: &[String]) -> anyhow::Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("Invalid parameter '{}', expected KEY=VALUE", param);
        };
        // Numbers, booleans and JSON literals keep their type.
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(serde_json::Value::Object(map))
}

fn print_views(views: &[JobStatusView], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(views)?);
        return Ok(());
    }
    for view in views {
        println!(
            "{}  {:<17} {:<12} {:<7} {}",
            view.id, view.pipeline, view.status, view.priority, view.message
        );
    }
    Ok(())
}
