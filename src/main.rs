use anyhow::Result;
use clap::{Parser, Subcommand};

use feedlink::logging::{self, LogMode, LoggingConfig};
use feedlink::{ClientConfig, ClientEvent, ConnectionManager};

#[derive(Parser)]
#[command(name = "feedlink")]
#[command(version)]
#[command(about = "Real-time subscription client for trading data feeds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory for session log files
    #[arg(long, global = true, default_value = "./logs")]
    log_dir: std::path::PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a topic and print its updates as JSON lines
    Stream(StreamArgs),
}

#[derive(clap::Args)]
struct StreamArgs {
    /// Endpoint URL, e.g. wss://feeds.example.com/stream
    #[arg(long)]
    url: String,

    /// Resource to subscribe to, e.g. bars
    #[arg(long)]
    resource: String,

    /// Topic the server must confirm, e.g. bars:AAPL:1
    #[arg(long)]
    topic: String,

    /// Subscription parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Log every raw frame at debug level
    #[arg(long)]
    log_frames: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init_logging(LoggingConfig::new(LogMode::ConsoleAndFile, &cli.log_dir))?;

    match run(cli).await {
        Ok(()) => {
            logging::log_session_end();
            Ok(())
        }
        Err(e) => {
            tracing::error!("Application error: {}", e);

            for cause in e.chain().skip(1) {
                tracing::error!("   Caused by: {}", cause);
            }

            logging::log_session_end();
            Err(e)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Stream(args) => stream(args).await,
    }
}

async fn stream(args: StreamArgs) -> Result<()> {
    let params: serde_json::Value = serde_json::from_str(&args.params)?;

    let mut config = ClientConfig::new(&args.url);
    config.reconnect = !args.no_reconnect;
    config.log_frames = args.log_frames;
    let max_attempts = config.max_reconnect_attempts;
    let base_delay = config.reconnect_delay_ms;

    let manager = ConnectionManager::websocket();
    let handle = manager.acquire(config);
    handle.connect_with_retries(max_attempts, base_delay).await?;

    let mut events = handle.events();
    let mut subscription = handle.subscribe(&args.resource, params, &args.topic).await?;
    tracing::info!(
        id = %subscription.id,
        topic = %args.topic,
        "streaming, press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            update = subscription.updates.recv() => match update {
                Some(payload) => println!("{}", serde_json::to_string(&payload)?),
                None => {
                    tracing::warn!("update stream ended");
                    break;
                }
            },
            event = events.recv() => {
                if let Ok(event) = event {
                    match event {
                        ClientEvent::SubscriptionLost { topic, reason, .. } => {
                            tracing::warn!(%topic, %reason, "subscription lost");
                            break;
                        }
                        other => tracing::info!(event = ?other, "connection event"),
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    handle
        .unsubscribe(&subscription.id, serde_json::json!({}))
        .await;
    handle.release();
    Ok(())
}
