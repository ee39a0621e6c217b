use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pitchside::pipeline::RunStage;
use pitchside::{MediaAsset, Pipeline, PipelineConfig};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("PITCHSIDE_GIT_HASH"),
    " ",
    env!("PITCHSIDE_BUILD_DATE"),
    ")"
);

/// Analyze match footage with a generative model.
#[derive(Debug, Parser)]
#[command(name = "pitchside", version = VERSION)]
struct Cli {
    /// Media file to analyze.
    file: PathBuf,

    /// Instruction sent to the model alongside the footage.
    #[arg(long)]
    prompt: String,

    /// API key for the endpoint.
    #[arg(long, env = "PITCHSIDE_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Endpoint base URL override.
    #[arg(long)]
    base_url: Option<String>,

    /// Model identifier override.
    #[arg(long)]
    model: Option<String>,

    /// Declared MIME type; inferred from the file extension when omitted.
    #[arg(long)]
    mime_type: Option<String>,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match analyze(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {}", e.class(), e);
            ExitCode::FAILURE
        }
    }
}

async fn analyze(cli: Cli) -> pitchside::Result<()> {
    let mut config = PipelineConfig::new(cli.api_key);
    if let Some(base_url) = cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }

    let asset = MediaAsset::from_path(&cli.file, cli.mime_type.as_deref()).await?;
    let pipeline = Pipeline::new(config)?;

    // Progress lines on stderr while the run is in flight.
    let mut rx = pipeline.subscribe();
    let progress = tokio::spawn(async move {
        let mut last_stage = RunStage::Idle;
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            if status.stage != last_stage {
                eprintln!("[{:>3}%] {}", status.progress, status.stage);
                last_stage = status.stage;
            }
            if status.stage.is_terminal() {
                break;
            }
        }
    });

    let result = pipeline.run(&asset, &cli.prompt).await;
    let _ = progress.await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(raw) = pipeline.status().raw_response {
                eprintln!("--- raw model output ---\n{raw}\n---");
            }
            return Err(e);
        }
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|e| pitchside::PipelineError::Transport(e.to_string()))?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &pitchside::MatchAnalysis) {
    let ctx = &report.match_context;
    println!("{} vs {}", ctx.home_team, ctx.away_team);
    if let Some(competition) = &ctx.competition {
        println!("  {competition}");
    }
    if let Some(score) = &ctx.score {
        println!("  score: {score}");
    }

    println!("\nformations:");
    println!("  home: {} ({})", report.formations.home.shape, report.formations.home.team);
    println!("  away: {} ({})", report.formations.away.shape, report.formations.away.team);

    if !report.events.is_empty() {
        println!("\nevents:");
        for event in &report.events {
            println!("  [{}] {}: {}", event.timestamp, event.kind, event.description);
        }
    }

    if !report.player_movements.is_empty() {
        println!("\nplayer movements:");
        for movement in &report.player_movements {
            match &movement.timestamp {
                Some(ts) => println!("  [{}] {}: {}", ts, movement.player, movement.observation),
                None => println!("  {}: {}", movement.player, movement.observation),
            }
        }
    }

    if !report.insights.is_empty() {
        println!("\ninsights:");
        for insight in &report.insights {
            println!("  {}: {}", insight.title, insight.detail);
            if let Some(moment) = &insight.key_moment {
                println!("    key moment at {} ({:.0}s)", moment.timestamp, moment.seconds);
            }
        }
    }
}
