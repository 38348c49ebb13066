use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use taskbot::access::{self, AccessControl};
use taskbot::bot::{Bot, Dispatcher};
use taskbot::channels::{Channel, Notifier, TelegramChannel};
use taskbot::config::BotConfig;
use taskbot::reminder::{self, ReminderScanner};
use taskbot::session::SessionManager;
use taskbot::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = BotConfig::from_env().context("Failed to load configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskbot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📋 Taskbot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Owner: {} ({})", config.owner_alias, config.owner_id);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    access::bootstrap_owner(db.as_ref(), config.owner_id, &config.owner_alias)
        .await
        .context("Failed to bootstrap owner identity")?;

    // ── Channel ──────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(config.bot_token.clone()));
    telegram
        .health_check()
        .await
        .context("Telegram health check failed")?;
    let channel: Arc<dyn Channel> = telegram.clone();
    let notifier: Arc<dyn Notifier> = telegram;

    // ── Core ─────────────────────────────────────────────────────────────
    let access = Arc::new(AccessControl::new(
        Arc::clone(&db),
        config.directory_visibility,
        config.timeouts.store,
    ));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&db),
        Arc::clone(&notifier),
        config.timeouts,
    ));
    let bot = Arc::new(Bot::new(
        Arc::clone(&db),
        access,
        Arc::clone(&sessions),
        Arc::clone(&notifier),
        config.timeouts,
        config.owner_id,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        bot,
        Arc::clone(&channel),
        config.timeouts.notify,
    ));

    // ── Reminders ────────────────────────────────────────────────────────
    let reminder_handle = if config.reminder.enabled {
        let scanner = Arc::new(ReminderScanner::new(
            Arc::clone(&db),
            Arc::clone(&notifier),
            config.reminder.clone(),
            config.timeouts,
        ));
        let handle =
            reminder::spawn_reminder_ticker(scanner).context("Invalid reminder schedule")?;
        eprintln!(
            "   Reminders: enabled ({}, window {} days, offset {})",
            config.reminder.schedule, config.reminder.window_days, config.reminder.utc_offset
        );
        Some(handle)
    } else {
        eprintln!("   Reminders: disabled");
        None
    };

    // Spawn session pruning task
    let session_idle_timeout = config.session_idle_timeout;
    let pruning_sessions = Arc::clone(&sessions);
    let pruning_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600)); // Every 10 min
        interval.tick().await; // Skip immediate first tick
        loop {
            interval.tick().await;
            let pruned = pruning_sessions.prune_idle(session_idle_timeout).await;
            if pruned > 0 {
                tracing::info!(pruned, "Pruned idle dialog sessions");
            }
        }
    });

    // ── Main loop ────────────────────────────────────────────────────────
    let mut message_stream = channel.start().await?;
    tracing::info!("Taskbot ready and listening");

    loop {
        let message = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down...");
                break;
            }
            msg = message_stream.next() => {
                match msg {
                    Some(m) => m,
                    None => {
                        tracing::info!("Channel stream ended, shutting down...");
                        break;
                    }
                }
            }
        };
        dispatcher.dispatch(message);
    }

    // Cleanup
    pruning_handle.abort();
    if let Some(handle) = reminder_handle {
        handle.abort();
    }
    channel.shutdown().await?;

    Ok(())
}
