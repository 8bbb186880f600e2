//! weatherdash CLI
//!
//! Usage:
//!   weatherdash snapshot                        # Fetch once, print the snapshot as JSON
//!   weatherdash poll                            # Poll the feed until Ctrl+C
//!   weatherdash forecast rows.json -m weekly    # Run the forecast model on context rows
//!   weatherdash ask "Will it rain tonight?"     # Stream an answer (Ctrl+C cancels)

use anyhow::{Context, Result};
use argh::FromArgs;
use chrono::Utc;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use weatherdash::dispatch::{cancel_pair, ChatRequest, ClaudeClient};
use weatherdash::forecast::{ForecastMode, ForecastRequest, Forecaster};
use weatherdash::{feed, Config, Dispatcher, FeedCache, RequestKind};

/// Weather station dashboard core
#[derive(FromArgs)]
struct Args {
    /// path to a YAML config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// log level: error, warn, info, debug, trace (default: info)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    log_level: String,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Snapshot(SnapshotArgs),
    Poll(PollArgs),
    Forecast(ForecastArgs),
    Ask(AskArgs),
}

/// Fetch the feed once and print the snapshot as JSON
#[derive(FromArgs)]
#[argh(subcommand, name = "snapshot")]
struct SnapshotArgs {}

/// Poll the feed on the configured interval until Ctrl+C
#[derive(FromArgs)]
#[argh(subcommand, name = "poll")]
struct PollArgs {}

/// Run the forecast model on a JSON file of context rows
#[derive(FromArgs)]
#[argh(subcommand, name = "forecast")]
struct ForecastArgs {
    /// JSON file holding an array of rows, or an object with a "rows" array
    #[argh(positional)]
    rows: PathBuf,

    /// forecast mode: hourly or weekly (default: hourly)
    #[argh(option, short = 'm', default = "ForecastMode::Hourly")]
    mode: ForecastMode,
}

/// Stream an answer to a prompt; Ctrl+C cancels
#[derive(FromArgs)]
#[argh(subcommand, name = "ask")]
struct AskArgs {
    /// the question to ask
    #[argh(positional)]
    prompt: String,

    /// request kind: chat or insight (default: chat)
    #[argh(option, short = 'k', default = "String::from(\"chat\")")]
    kind: String,

    /// optional system prompt
    #[argh(option, short = 's')]
    system: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(log_level));

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    match args.command {
        Command::Snapshot(_) => snapshot(&config).await,
        Command::Poll(_) => poll(&config).await,
        Command::Forecast(a) => forecast(&config, a).await,
        Command::Ask(a) => ask(&config, a).await,
    }
}

async fn snapshot(config: &Config) -> Result<()> {
    let source = feed::source_from_config(&config.feed)?;
    let cache = FeedCache::new(source, &config.feed);
    let snapshot = cache.get_snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn poll(config: &Config) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, initiating shutdown...");
        let _ = shutdown_tx.send(());
    })
    .context("failed to set Ctrl+C handler")?;

    let source = feed::source_from_config(&config.feed)?;
    let cache = FeedCache::new(source, &config.feed).with_shutdown(shutdown_rx.clone());
    cache.start_polling();

    // Print a line whenever a refresh completes.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut seen = None;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let snap = cache.cached();
                let marker = (snap.last_success_at, snap.last_error.clone());
                if marker.0.is_none() && marker.1.is_none() {
                    continue;
                }
                if seen.as_ref() == Some(&marker) {
                    continue;
                }
                seen = Some(marker);
                println!("{}", serde_json::to_string(&snap)?);
            }
        }
    }

    log::info!("weatherdash poller exiting");
    Ok(())
}

async fn forecast(config: &Config, args: ForecastArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.rows)
        .with_context(|| format!("failed to read {}", args.rows.display()))?;
    let doc: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.rows.display()))?;
    let rows = match doc {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("rows") {
            Some(Value::Array(rows)) => rows,
            _ => anyhow::bail!("{} has no \"rows\" array", args.rows.display()),
        },
        _ => anyhow::bail!("{} must hold an array of rows", args.rows.display()),
    };

    let request = ForecastRequest::from_json_rows(Utc::now(), &rows);
    let outcome = Forecaster::new(&config.forecast)
        .forecast_or_warning(args.mode, &request)
        .await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn ask(config: &Config, args: AskArgs) -> Result<()> {
    let kind = match args.kind.to_lowercase().as_str() {
        "chat" => RequestKind::Chat,
        "insight" => RequestKind::Insight,
        other => anyhow::bail!("unknown request kind '{}'", other),
    };

    let client = ClaudeClient::from_env(&config.dispatch)?;
    let dispatcher = Dispatcher::new(client, &config.dispatch);

    let (handle, signal) = cancel_pair();
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, cancelling request...");
        handle.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    let mut request = ChatRequest::prompt(&args.prompt);
    if let Some(system) = args.system {
        request = request.with_system(system);
    }

    let mut stream = match dispatcher.stream(kind, &request, &signal).await {
        Ok(stream) => stream,
        Err(e) => anyhow::bail!("request failed ({}): {}", e.http_status(), e),
    };
    log::info!("Answering with {} ({})", stream.model(), stream.effort());

    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next_chunk().await {
        let text = chunk.context("stream interrupted")?;
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    if stream.was_cancelled() {
        log::warn!("Answer cancelled");
    }
    Ok(())
}
