use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sentry_cli::advisor::AdvisorClient;
use sentry_cli::agents::AgentService;
use sentry_cli::approvals::ApprovalManager;
use sentry_cli::bus::LocalBus;
use sentry_cli::cli::Cli;
use sentry_cli::config::{load_agent_config, load_policy};
use sentry_cli::notify::Notifier;
use sentry_cli::orchestrator::{Orchestrator, load_orchestrator_config};
use sentry_cli::policy::PolicyEngine;
use sentry_cli::runner::{HostRuntime, Runner};
use sentry_cli::state::StateStore;
use sentry_cli::tmux::TmuxAdapter;

const ORCHESTRATOR_CONFIG_PATH: &str = ".sentry/orchestrator.toml";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Configuration problems are fatal at startup; the error chain names
    // the offending file.
    let agent_config = load_agent_config(&cli.config)?;
    let policy_doc = load_policy(&cli.policy)?;
    let engine = PolicyEngine::compile(&policy_doc)
        .with_context(|| format!("failed to compile policy {}", cli.policy.display()))?;
    info!(
        pipelines = policy_doc.pipelines.len(),
        principles = engine.principles().len(),
        "policy loaded from {}",
        cli.policy.display()
    );

    let sqlite_path = agent_config.expanded_sqlite_path();
    let store = StateStore::open(&sqlite_path)
        .with_context(|| format!("failed to open state store {}", sqlite_path.display()))?;
    let bus = LocalBus::new(&agent_config.expanded_bus_dir())?;
    let notifier = Notifier::new(&agent_config.notify, bus.clone())?;
    let approvals = ApprovalManager::new(
        agent_config.expanded_approval_dir(),
        cli.approval_secret.clone(),
        cli.public_base_url.clone(),
        ApprovalManager::DEFAULT_TOKEN_TTL_SECS,
    )?;

    let mut runtimes = Vec::new();
    for host in &agent_config.hosts {
        let adapter = TmuxAdapter::new(
            &agent_config.tmux_bin,
            Some(host.tmux.socket.as_str()),
            host.ssh.clone(),
        );
        runtimes.push(HostRuntime::new(host.clone(), Box::new(adapter))?);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }

    // The orchestrator runs beside the supervisor when its config exists.
    // The two loops share nothing in memory; each opens its own store
    // connection and coordinates through SQLite and the bus journals.
    let orchestrator_config_path = Path::new(ORCHESTRATOR_CONFIG_PATH);
    let orchestrator_handle = if !cli.once && orchestrator_config_path.exists() {
        let config = load_orchestrator_config(orchestrator_config_path)?;
        let store = StateStore::open(&sqlite_path)
            .with_context(|| format!("failed to open state store {}", sqlite_path.display()))?;
        let notifier = Notifier::new(&agent_config.notify, bus.clone())?;
        let agents = AgentService::new(
            Box::new(TmuxAdapter::new(&agent_config.tmux_bin, None, None)),
            &config.session_prefix,
        );
        let advisor = AdvisorClient::new(
            config.advisor.executable(),
            config.advisor.env.clone(),
            config.advisor.timeout(),
        );
        let bus = bus.clone();
        let stop = stop.clone();
        info!("orchestrator enabled from {}", orchestrator_config_path.display());
        Some(std::thread::spawn(move || {
            let mut orchestrator =
                Orchestrator::new(config, store, agents, bus, notifier, advisor);
            orchestrator.run_forever(&stop);
        }))
    } else {
        None
    };

    let mut runner = Runner::new(
        agent_config,
        store,
        engine,
        approvals,
        notifier,
        bus,
        runtimes,
        cli.dry_run,
    );

    let result = if cli.once {
        runner.run_once()
    } else {
        runner.run_forever(&stop)
    };

    // Bring the orchestrator down with us, clean or not.
    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = orchestrator_handle {
        let _ = handle.join();
    }
    result
}
