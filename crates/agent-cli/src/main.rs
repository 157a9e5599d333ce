//! Process entrypoint for the management-plane agent runtime.
//!
//! Deliberately thin (§1 "Out of scope: the HTTP query surface and CLI";
//! SPEC_FULL.md §0 crate map): load the configuration document, construct
//! an [`agent_runtime::Runtime`], run it until the process receives a
//! shutdown signal, and translate the outcome into an exit code (§6 "Exit
//! codes"). Anything that needs a policy [`agent_types::Evaluator`] wired
//! in — discovery, decision-log masking/drop — is the embedder's job;
//! link `agent-runtime` directly for that instead of this binary.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "agentd", version, about = "Management-plane agent runtime")]
struct Cli {
    /// Path to the configuration document (JSON or YAML, auto-detected).
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override a config value by dot-separated path (repeatable), e.g.
    /// `--set bundles.main.service=control-plane`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Override a config value with the contents of a file (repeatable),
    /// e.g. `--set-file keys.global.key=/run/secrets/opa.pem`.
    #[arg(long = "set-file", value_name = "KEY=PATH")]
    set_file: Vec<String>,

    /// Override `persistence_directory` from the config document.
    #[arg(long)]
    persistence_directory: Option<PathBuf>,

    /// Emit logs as newline-delimited JSON instead of human-readable text.
    #[arg(long)]
    log_format_json: bool,
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn parse_kv(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("override {raw:?} must be KEY=VALUE"))?;
    Ok((key.to_string(), value.to_string()))
}

fn load_config(cli: &Cli) -> Result<agent_config::Config> {
    let set_overrides = cli.set.iter().map(|raw| parse_kv(raw)).collect::<Result<Vec<_>>>()?;

    let set_file_overrides_raw =
        cli.set_file.iter().map(|raw| parse_kv(raw)).collect::<Result<Vec<_>>>()?;
    let set_file_overrides: Vec<(String, &std::path::Path)> = set_file_overrides_raw
        .iter()
        .map(|(k, v)| (k.clone(), std::path::Path::new(v.as_str())))
        .collect();

    agent_config::load_from_file(&cli.config, &set_overrides, &set_file_overrides)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(error = %err, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "agent exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    let persistence_directory = cli.persistence_directory.clone();
    let agent = agent_runtime::Runtime::bootstrap(config, None, persistence_directory)
        .await
        .context("failed to bootstrap the agent runtime")?;

    tracing::info!("agent runtime started");

    let token = agent.cancellation_token();
    tokio::spawn(wait_for_shutdown_signal(token));

    agent.clone().run().await;
    tracing::info!("agent runtime stopped cleanly");
    Ok(())
}

/// Cancel `token` on SIGINT, and on SIGTERM where the platform has one
/// (§5 "Plugin `Stop` cancels the subtree's token").
async fn wait_for_shutdown_signal(token: tokio_util::sync::CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}
