mod cli;
mod telemetry;
mod view;

use anyhow::Context;
use clap::Parser;
use ticket_sync::{LoadOutcome, SyncConfig, SyncSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::{Cli, DashCommand};
use crate::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let (env_cfg, env_err) = match SyncConfig::try_from_env() {
        Ok(cfg) => (cfg, None),
        Err(err) => (SyncConfig::default().normalize(), Some(err)),
    };
    let cfg = cli.apply(env_cfg);
    init_tracing(&cfg.log_filter);
    if let Some(err) = env_err {
        warn!(error = %err, "invalid TICKET_SYNC_* configuration; using defaults");
    }
    cfg.validate().context("invalid endpoint configuration")?;

    info!(
        base = %cfg.base_url,
        stream = %cfg.stream_url(),
        collection = %cfg.collection,
        page_size = cfg.page_size,
        merge_policy = ?cfg.merge_policy,
        backoff_base_ms = cfg.backoff_base_ms,
        backoff_max_ms = cfg.backoff_max_ms,
        handshake_timeout_ms = cfg.handshake_timeout_ms,
        liveness_timeout_ms = cfg.liveness_timeout_ms,
        select = %cli.select.as_deref().unwrap_or("unset"),
        "starting ticket-dash"
    );

    let session = SyncSession::from_config(&cfg);
    session.start().context("starting stream consumer")?;
    for _ in 0..cli.preload {
        if !load_more(&session).await {
            break;
        }
    }

    let mut selected = cli.select.clone();
    let mut projector = session.projector();
    view::log_view(&projector, selected.as_deref());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("stdin closed; following the stream until interrupted");
                        stdin_open = false;
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to read stdin");
                        stdin_open = false;
                        continue;
                    }
                };
                match line.parse::<DashCommand>() {
                    Ok(DashCommand::LoadMore) => {
                        load_more(&session).await;
                    }
                    Ok(DashCommand::Restart) => match session.restart_stream() {
                        Ok(generation) => info!(generation, "stream restarted"),
                        Err(err) => warn!(error = %err, "stream restart refused"),
                    },
                    Ok(DashCommand::Reset) => session.reset(),
                    Ok(DashCommand::Select(id)) => {
                        selected = id;
                        view::log_view(&projector, selected.as_deref());
                    }
                    Ok(DashCommand::Status { id, status }) => {
                        match session.update_status(&id, status).await {
                            Ok(Some(_)) => info!(%id, status, "status updated"),
                            Ok(None) => warn!(%id, status, "status update not applied"),
                            Err(err) => warn!(%id, status, error = %err, "status update failed"),
                        }
                    }
                    Ok(DashCommand::Quit) => break,
                    Err(err) => warn!(input = %line, "{err}"),
                }
            }
            changed = projector.changed() => {
                if !changed {
                    break;
                }
                view::log_view(&projector, selected.as_deref());
                if let Some(err) = session.last_stream_error() {
                    info!(error = %err, "last stream error");
                }
            }
        }
    }

    session.shutdown();
    info!("ticket-dash stopped");
    Ok(())
}

/// Returns whether more pages remain.
async fn load_more(session: &SyncSession) -> bool {
    match session.load_next().await {
        Ok(LoadOutcome::Loaded(page)) => {
            info!(
                page = page.meta.current_page,
                records = page.data.len(),
                has_more = session.has_more(),
                "loaded page"
            );
        }
        Ok(LoadOutcome::Exhausted) => info!("no more pages"),
        Err(err) => warn!(error = %err, "page load failed; trigger again to retry"),
    }
    session.has_more()
}
