//! Deal Co-Pilot CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::{style, Term};
use deal_core::AppConfig;
use deal_flow::FlowEngine;
use deal_openai::agents::GenerationSettings;
use deal_openai::{build_executors, OpenAIClient};
use deal_protocol::{
    DataRoomDocument, DealContext, EventEnvelope, RefineRequest, SkipRequest, StageName,
    StartRequest, WorkflowEvent, WorkflowId, WorkflowSnapshot,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deal")]
#[command(about = "Deal Co-Pilot - human-in-the-loop due-diligence workflows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the REST and SSE API
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to bind, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run a workflow in the terminal, reviewing each stage interactively
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Company under review
        #[arg(long)]
        company: String,

        /// Company website
        #[arg(long, default_value = "")]
        website: String,

        /// Sector
        #[arg(long)]
        sector: Option<String>,

        /// Region
        #[arg(long)]
        region: Option<String>,

        /// Headquarters location
        #[arg(long)]
        hq: Option<String>,

        /// Optional stage to enable (research, extraction); repeatable
        #[arg(long = "stage", value_name = "STAGE")]
        stages: Vec<StageName>,

        /// Extracted text of a data-room file, e.g. deck.pdf.txt; repeatable
        #[arg(long = "doc", value_name = "PATH")]
        documents: Vec<PathBuf>,

        /// Write every stage output to this JSON file on completion
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Accept every stage without prompting
        #[arg(long)]
        auto: bool,
    },

    /// Print the JSON schemas of the API payloads and events
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The terminal runner keeps logs quiet so streamed text stays readable
    let default_level = match cli.command {
        Commands::Run { .. } => "warn",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { config, listen } => serve(config, listen).await,
        Commands::Run {
            config,
            company,
            website,
            sector,
            region,
            hq,
            stages,
            documents,
            out,
            auto,
        } => {
            let mut context = DealContext::new(company, website);
            if let Some(sector) = sector {
                context = context.with_sector(sector);
            }
            if let Some(region) = region {
                context = context.with_region(region);
            }
            context.hq_location = hq;
            run_workflow(config, context, stages, documents, out, auto).await
        }
        Commands::Schema => print_schemas(),
    }
}

fn build_engine(config: &AppConfig) -> anyhow::Result<FlowEngine> {
    let client = OpenAIClient::from_provider(&config.provider)?;
    let executors = build_executors(
        Arc::new(client),
        tokio::runtime::Handle::current(),
        GenerationSettings::from(&config.provider),
    );
    Ok(FlowEngine::new(executors, config.engine.clone()))
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> anyhow::Result<()> {
    let mut config = AppConfig::load(config_path.as_deref())?;
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.server.listen_addr))?;

    let engine = build_engine(&config)?;
    deal_server::serve(addr, deal_server::AppState::new(engine)).await
}

async fn read_documents(paths: &[PathBuf]) -> anyhow::Result<Vec<DataRoomDocument>> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        // `deck.pdf.txt` holds text extracted from `deck.pdf`
        if let Some(original) = filename.strip_suffix(".txt") {
            filename = original.to_string();
        }
        documents.push(DataRoomDocument::new(filename, content));
    }
    Ok(documents)
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(template);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn run_workflow(
    config_path: Option<PathBuf>,
    context: DealContext,
    stages: Vec<StageName>,
    document_paths: Vec<PathBuf>,
    out: Option<PathBuf>,
    auto: bool,
) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let engine = build_engine(&config)?;
    let documents = read_documents(&document_paths).await?;

    println!(
        "{}",
        style(format!("📊 Deal Co-Pilot: {}", context.company_name))
            .bold()
            .cyan()
    );
    if !documents.is_empty() {
        println!("  Data room: {} document(s)", documents.len());
    }

    let id = engine
        .start(StartRequest {
            context,
            stages,
            documents,
        })
        .await?;
    println!("  Workflow: {}", style(id).dim());

    let mut events = engine.subscribe(id).await?;
    let mut progress: Option<ProgressBar> = None;

    while let Some(EventEnvelope { event, .. }) = events.next().await {
        match event {
            WorkflowEvent::Status { message, .. } => {
                println!("\n{}", style(format!("▶ {}", message)).bold());
                progress = Some(spinner("Waiting for the model...".to_string()));
            }
            WorkflowEvent::Progress {
                percent, message, ..
            } => match &progress {
                Some(pb) => pb.set_message(format!("{:>3}% {}", percent, message)),
                None => tracing::debug!(percent, "{}", message),
            },
            WorkflowEvent::Chunk { content, .. } => {
                if let Some(pb) = progress.take() {
                    pb.finish_and_clear();
                }
                print!("{}", content);
                std::io::stdout().flush()?;
            }
            WorkflowEvent::StepComplete { stage } => {
                if let Some(pb) = progress.take() {
                    pb.finish_and_clear();
                }
                println!(
                    "\n\n{}",
                    style(format!("✅ {} ready for review", stage.title())).green()
                );
                review(&engine, id, stage, false, auto).await?;
            }
            WorkflowEvent::Error { stage, message } => {
                if let Some(pb) = progress.take() {
                    pb.finish_and_clear();
                }
                println!(
                    "\n\n{}",
                    style(format!("❌ {} failed: {}", stage.title(), message)).red()
                );
                review(&engine, id, stage, true, auto).await?;
            }
            WorkflowEvent::Cancelled { .. } => {
                println!("\n{}", style("Workflow cancelled").yellow());
                return Ok(());
            }
            WorkflowEvent::Completed => {
                println!("\n{}", style("🎉 Workflow complete").bold().green());
                break;
            }
        }
    }

    let outputs = engine.outputs(id).await?;
    match out {
        Some(path) => {
            write_json(&path, &outputs).await?;
            println!("  Outputs written to {}", path.display());
        }
        None => {
            for stage in outputs.keys() {
                println!("  {} {}", style("•").cyan(), stage.title());
            }
            println!("  {}", style("Use --out FILE to save the stage outputs").dim());
        }
    }
    Ok(())
}

async fn write_json(path: &Path, value: &impl serde::Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

enum Decision {
    Continue,
    Refine(String),
    Skip,
    Cancel,
    View,
}

async fn ask(stage: StageName, failed: bool) -> anyhow::Result<Decision> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Decision> {
        let term = Term::stdout();
        let options = if failed {
            "[r]etry  [s]kip  [x] cancel"
        } else {
            "[c]ontinue  [r]efine  [v]iew  [s]kip  [x] cancel"
        };
        loop {
            term.write_str(&format!("{} {} ", style(stage.title()).cyan(), style(options).bold()))?;

            let choice = term.read_line()?;
            match choice.trim().to_lowercase().as_str() {
                "" | "c" | "continue" if !failed => return Ok(Decision::Continue),
                "v" | "view" => return Ok(Decision::View),
                "s" | "skip" => return Ok(Decision::Skip),
                "x" | "cancel" => return Ok(Decision::Cancel),
                "r" | "refine" | "retry" => {
                    term.write_str("Feedback: ")?;
                    let feedback = term.read_line()?;
                    if feedback.trim().is_empty() && failed {
                        return Ok(Decision::Refine("Retry the stage.".to_string()));
                    }
                    if feedback.trim().is_empty() {
                        term.write_line("Feedback must not be empty")?;
                        continue;
                    }
                    return Ok(Decision::Refine(feedback));
                }
                other => term.write_line(&format!("Unknown choice: {}", other))?,
            }
        }
    })
    .await?
}

/// Drive one review gate to a decision the engine accepts
async fn review(
    engine: &FlowEngine,
    id: WorkflowId,
    stage: StageName,
    failed: bool,
    auto: bool,
) -> anyhow::Result<()> {
    loop {
        let decision = if auto {
            if failed {
                Decision::Cancel
            } else {
                Decision::Continue
            }
        } else {
            ask(stage, failed).await?
        };

        let result: deal_core::Result<WorkflowSnapshot> = match decision {
            Decision::View => {
                match engine.output(id, stage).await {
                    Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
                    Err(e) => println!("{}", style(e).yellow()),
                }
                continue;
            }
            Decision::Continue => engine.continue_workflow(id).await,
            Decision::Refine(feedback) => engine.refine(id, stage, feedback).await,
            Decision::Skip => engine.skip(id, stage).await,
            Decision::Cancel => engine.cancel(id).await,
        };

        match result {
            Ok(_) => return Ok(()),
            Err(e) if auto => return Err(e.into()),
            Err(e) => println!("{}", style(e).red()),
        }
    }
}

fn print_schemas() -> anyhow::Result<()> {
    let schemas = serde_json::json!({
        "StartRequest": schemars::schema_for!(StartRequest),
        "RefineRequest": schemars::schema_for!(RefineRequest),
        "SkipRequest": schemars::schema_for!(SkipRequest),
        "WorkflowSnapshot": schemars::schema_for!(WorkflowSnapshot),
        "EventEnvelope": schemars::schema_for!(EventEnvelope),
    });
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}
