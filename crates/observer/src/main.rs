use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use folio_observer::{ObserverClient, ObserverConfig, ObserverUpdate};

#[derive(Debug, Parser)]
#[command(author, version, about = "Submit generation jobs and follow their progress", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a job and follow it to a final state
    Submit {
        /// Job id (assigned by the server when omitted)
        #[arg(long)]
        job_id: Option<String>,
        /// Generation payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Follow a job submitted elsewhere
    Watch { job_id: String },
    /// Follow every fresh job in the local state file
    Resume,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio_observer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ObserverConfig::from_env().context("Invalid observer configuration")?;
    let mut client = ObserverClient::open(config)
        .await
        .context("Failed to open observer state")?;

    match cli.command {
        Commands::Submit {
            job_id,
            payload,
            max_attempts,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            client
                .submit(job_id.as_deref(), &payload, max_attempts)
                .await
                .context("Submission failed")?;
        }
        Commands::Watch { job_id } => client.watch(&job_id).await?,
        Commands::Resume => {}
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
        tracing::info!("Received SIGINT (Ctrl-C), stopping");
        signal_cancel.cancel();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            log_update(&update);
        }
    });

    client.run(tx, cancel).await.context("Observer stopped")?;
    let _ = printer.await;
    Ok(())
}

fn log_update(update: &ObserverUpdate) {
    match update {
        ObserverUpdate::Connected { connection_id } => {
            tracing::info!(connection_id = %connection_id, "Connected");
        }
        ObserverUpdate::Disconnected => tracing::warn!("Disconnected, polling for status"),
        ObserverUpdate::Job { progress, source } => tracing::info!(
            job_id = %progress.job_id,
            status = %progress.status,
            progress = progress.progress,
            message = %progress.message,
            result_ref = progress.result_ref.as_deref().unwrap_or(""),
            error_detail = progress.error_detail.as_deref().unwrap_or(""),
            ?source,
            "Job update",
        ),
        ObserverUpdate::Expired { job_id } => {
            tracing::warn!(job_id = %job_id, "Job no longer known to the server");
        }
    }
}
