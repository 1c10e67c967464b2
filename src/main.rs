mod cli;
mod config;
mod confirm;
mod error;
mod orchestrator;
mod report;
mod source;
mod state_machine;
mod status;
mod telephony;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::WarmlineConfig;
use confirm::{ConfirmationGate, ScriptedGate, TerminalGate};
use orchestrator::ConferenceOrchestrator;
use report::StatusReporter;
use source::JobSource;
use state_machine::CallJob;
use status::LiveStatus;
use telephony::{ScriptedProvider, TelephonyProvider};
use ui::FlowProgress;

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warmline=debug"
    } else {
        "warmline=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = WarmlineConfig::load_from(Path::new(&cli.config))?;
    let auto_accept = cli.auto_accept || config.auto_accept;

    match cli.command {
        Command::Run { once } => run_service(&config, auto_accept, once).await,
        Command::Call { first, second } => run_single(&config, auto_accept, first, second).await,
        Command::Demo => run_demo().await,
    }
}

// TODO: wire a real telephony backend; the scripted provider stands in
// until one exists, answering every placed call after a short delay.
fn stand_in_provider() -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::answered_after(&[
        Duration::from_secs(2),
        Duration::from_secs(3),
    ]))
}

fn gate_for(auto_accept: bool) -> Arc<dyn ConfirmationGate> {
    if auto_accept {
        Arc::new(ScriptedGate::accept_all())
    } else {
        Arc::new(TerminalGate)
    }
}

fn build_orchestrator(
    config: &WarmlineConfig,
    auto_accept: bool,
    provider: Arc<dyn TelephonyProvider>,
    live: LiveStatus,
) -> ConferenceOrchestrator {
    ConferenceOrchestrator::new(
        provider,
        gate_for(auto_accept),
        Arc::new(StatusReporter::new(
            config.server_url.clone(),
            config.api_key.clone(),
        )),
        live,
        config.flow_timing(),
    )
}

/// Polling service: fetch one pending job from the CRM per cycle, run it
/// to its terminal state, report, repeat.
async fn run_service(config: &WarmlineConfig, auto_accept: bool, once: bool) -> Result<()> {
    if !config.is_configured() {
        warn!("server_url and api_key are required for polling; nothing to do");
        return Ok(());
    }

    let source = JobSource::new(config.server_url.clone(), config.api_key.clone());
    let live = LiveStatus::new();
    let orch = build_orchestrator(config, auto_accept, stand_in_provider(), live.clone());
    let poll_interval = Duration::from_secs(config.poll_interval_secs);

    info!(
        server = %config.server_url,
        interval_secs = config.poll_interval_secs,
        "polling for pending calls"
    );

    loop {
        match source.fetch_pending().await {
            Ok(Some(pending)) => {
                info!(job = pending.id, "pending call accepted");
                let job = CallJob::new(
                    pending.id,
                    pending.team_member_number,
                    pending.contact_number,
                    auto_accept,
                );

                let progress = FlowProgress::start(&format!("Job #{}", job.id));
                let follower = progress.follow(live.subscribe());
                let report = orch.run_job(job).await?;
                follower.abort();
                progress.complete(&report.outcome);
                progress.print_report(&report);
            }
            Ok(None) => {}
            // The queue endpoint answering garbage must not kill the
            // service; next cycle tries again.
            Err(e) => warn!("poll failed: {e}"),
        }

        if once {
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }
    Ok(())
}

/// One ad-hoc conference between two numbers, no CRM involved.
async fn run_single(
    config: &WarmlineConfig,
    auto_accept: bool,
    first: String,
    second: String,
) -> Result<()> {
    let live = LiveStatus::new();
    let orch = build_orchestrator(config, auto_accept, stand_in_provider(), live.clone());

    let job = CallJob::new(0, first, second, auto_accept);
    let progress = FlowProgress::start(&format!("{} + {}", job.first_party, job.second_party));
    let follower = progress.follow(live.subscribe());
    let report = orch.run_job(job).await?;
    follower.abort();
    progress.complete(&report.outcome);
    progress.print_report(&report);
    Ok(())
}

/// Self-contained demonstration: scripted calls answer after a couple of
/// seconds and every confirmation is accepted, so the full flow runs
/// without any backend.
async fn run_demo() -> Result<()> {
    let provider = Arc::new(ScriptedProvider::answered_after(&[
        Duration::from_secs(2),
        Duration::from_secs(5),
    ]));
    let live = LiveStatus::new();
    let orch = ConferenceOrchestrator::new(
        provider,
        Arc::new(ScriptedGate::accept_all()),
        Arc::new(StatusReporter::new(String::new(), String::new())),
        live.clone(),
        WarmlineConfig::default().flow_timing(),
    );

    // auto_accept=false so the demo also exercises the confirmation gate.
    let job = CallJob::new(1, "+1 555 0100".into(), "+1 555 0199".into(), false);
    let progress = FlowProgress::start("Demo conference");
    let follower = progress.follow(live.subscribe());
    let report = orch.run_job(job).await?;
    follower.abort();
    progress.complete(&report.outcome);
    progress.print_report(&report);

    println!();
    println!("Event log (newest first):");
    for entry in live.entries() {
        println!("  {entry}");
    }
    Ok(())
}
