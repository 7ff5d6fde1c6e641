use clap::Parser;
use config::Config;
use flume::bounded;
use std::process::ExitStatus;
use tracing::{debug, error, info, warn};
use tracing_log::AsTrace;
use tracker::filter::SubjectFilter;
use tracker::route::EventRouter;
use tracker::{Tracker, track, usage};

mod cli;
mod error;
mod probe;
mod runner;
mod signals;

use crate::cli::Cli;
use crate::runner::Runner;
use crate::signals::{SignalEvent, wait_for_signal};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.log_level_filter().as_trace())
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    debug!(config = ?cli);

    let config = match &cli.conffile {
        Some(path) => Config::load(path)?,
        _ => Config::new(),
    };

    if cli.print_config {
        #[allow(clippy::print_stdout)]
        {
            println!("{}", config.to_toml_string()?);
        }
        return Ok(());
    }

    if !cli.all && cli.command.is_empty() {
        anyhow::bail!("nothing to trace: pass a command or --all");
    }

    let tracker = Tracker::new(&config);
    info!(page_size = tracker.page_size(), "tracker initialized");

    let mut filter = SubjectFilter::new(
        std::process::id() as i32,
        config.model.max_buffered_events,
    );
    let mut runner = None;
    if cli.all {
        filter.enable_global_mode();
    } else {
        let spawned = Runner::spawn(&cli.command)?;
        filter.mark_root_tracked(spawned.pid());
        runner = Some(spawned);
    }

    let (events_tx, events_rx) = bounded(1024);
    let (signals_tx, signals_rx) = bounded(8);

    let router = EventRouter::new(filter, tracker.clone());
    let router_task = tokio::spawn(router.run(events_rx));

    tokio::spawn(usage::usage_loop(
        tracker.clone(),
        config.model.usage_interval,
    ));
    tokio::spawn(track::summary_loop(
        tracker.clone(),
        config.model.summary_interval,
    ));
    tokio::spawn(async move {
        if let Err(err) = wait_for_signal(&signals_tx).await {
            error!(error = ?err, "Error while waiting for signal");
        }
    });

    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| config.system.socket.clone());
    let probe_task = tokio::spawn(async move {
        if let Err(err) = probe::pump_events(&socket, &events_tx).await {
            error!(error = ?err, "probe intake failed");
        }
        // events_tx drops here, which ends the router
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            res = signals_rx.recv_async() => {
                match res? {
                    SignalEvent::SigUSR1 => tracker.dump_summary(),
                    SignalEvent::SigUSR2 => {
                        info!(deltas = tracker.catchup_log().len(), "feed stats");
                    }
                    SignalEvent::Terminate => {
                        info!("terminated, shutting down");
                        break;
                    }
                }
            }
            status = wait_if_running(&mut runner) => {
                match status {
                    Ok(status) => info!(%status, "traced command exited"),
                    Err(err) => warn!(error = ?err, "failed to reap traced command"),
                }
                // keep tracing surviving descendants until interrupted
                runner = None;
            }
        }
    }

    if let Some(mut runner) = runner {
        runner.cleanup().await;
    }
    probe_task.abort();
    router_task.abort();
    Ok(())
}

/// Wait for the traced command, or forever when none is running.
async fn wait_if_running(runner: &mut Option<Runner>) -> std::io::Result<ExitStatus> {
    match runner {
        Some(runner) => runner.wait().await,
        None => std::future::pending().await,
    }
}
