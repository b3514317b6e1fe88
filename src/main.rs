use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use campaign_mailer::campaign::model::Recipient;
use campaign_mailer::campaign::{CampaignController, CampaignEvent, CampaignRequest, Dispatcher};
use campaign_mailer::config::MailerConfig;
use campaign_mailer::delivery::ResendClient;
use campaign_mailer::store::{Database, LibSqlBackend};
use campaign_mailer::templates::PlaceholderTemplates;

const USAGE: &str = "usage: campaign-mailer <recipients.json> <template-id> <subject> [--dry-run]";

struct Args {
    recipients: PathBuf,
    template_id: String,
    subject: String,
    dry_run: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut dry_run = false;
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }
    let [recipients, template_id, subject]: [String; 3] = match positional.try_into() {
        Ok(args) => args,
        Err(_) => bail!(USAGE),
    };
    Ok(Args {
        recipients: PathBuf::from(recipients),
        template_id,
        subject,
        dry_run,
    })
}

/// Stderr logging, plus a daily-rolling file when a log directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "campaign-mailer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn load_recipients(path: &Path) -> anyhow::Result<Vec<Recipient>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading recipients from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing recipients in {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let mut config = MailerConfig::from_env()?;
    config.dispatch.dry_run |= args.dry_run;
    let _log_guard = init_tracing(config.log_dir.as_deref());
    config.validate(!config.dispatch.dry_run)?;

    let recipients = load_recipients(&args.recipients)?;

    eprintln!("📬 Campaign Mailer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Recipients: {}", recipients.len());
    eprintln!("   Template: {}", args.template_id);
    eprintln!("   Concurrency: {}", config.dispatch.concurrency);
    eprintln!("   Daily limit: {}", config.dispatch.daily_limit);
    eprintln!("   Database: {}", config.database_path.display());
    if config.dispatch.dry_run {
        eprintln!("   Mode: DRY RUN (nothing will be sent)");
    }
    eprintln!("   Press Ctrl-C to cancel.\n");

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| format!("opening database at {}", config.database_path.display()))?,
    );
    let renderer = Arc::new(PlaceholderTemplates::load_dir(&config.templates_dir)?);
    let provider = Arc::new(ResendClient::new(&config.provider)?);
    let dispatcher = Dispatcher::from_config(&config.dispatch, store, provider, renderer);

    let controller = CampaignController::new();
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling campaign...");
                controller.cancel();
            }
        });
    }

    let request = CampaignRequest::new(recipients, args.template_id, args.subject)
        .concurrency(config.dispatch.concurrency)
        .dry_run(config.dispatch.dry_run)
        .controller(controller);

    let mut events = dispatcher.run(request);
    let mut aborted = false;
    while let Some(event) = events.next().await {
        match &event {
            CampaignEvent::Progress { outcome, stats } => {
                let status = if outcome.success { "ok  " } else { "FAIL" };
                println!(
                    "[{:>5}] {status} {} {}",
                    stats.total,
                    outcome.email,
                    outcome
                        .error
                        .as_deref()
                        .or(outcome.message_id.as_deref())
                        .unwrap_or("")
                );
            }
            CampaignEvent::Finished { stats } => {
                println!(
                    "Finished: {} sent, {} ok, {} failed in {:.1}s ({:.1}/s)",
                    stats.total, stats.success, stats.failed, stats.elapsed_secs, stats.rate
                );
            }
            CampaignEvent::Error {
                reason,
                message,
                stats,
            } => {
                aborted = true;
                eprintln!(
                    "Aborted ({reason:?}){}: {} completed before stop",
                    message.as_deref().map(|m| format!(" {m}")).unwrap_or_default(),
                    stats.total
                );
            }
        }
    }

    let remaining = dispatcher.deps().quota.remaining().await?;
    eprintln!("   Quota remaining today: {remaining}");

    if aborted {
        std::process::exit(1);
    }
    Ok(())
}
