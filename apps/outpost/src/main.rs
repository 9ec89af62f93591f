use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use outpost_agent_core::auth::DirectiveVerifier;
use outpost_agent_core::config::{AgentConfig, Cli};
use outpost_agent_core::exec::ShellRunner;
use outpost_agent_core::heartbeat::{HeartbeatEmitter, HEARTBEAT_INTERVAL};
use outpost_agent_core::session::SessionEngine;
use outpost_agent_core::stats::ProcStatsSampler;
use outpost_agent_core::telemetry;
use outpost_agent_core::update::{RestartPolicy, Updater, RESTART_GRACE};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init()?;

    let config = AgentConfig::try_from(Cli::parse()).context("invalid agent configuration")?;
    info!(
        version = %config.credentials.version,
        server_id = %config.credentials.server_id,
        endpoint = %config.endpoint,
        "starting outpost agent"
    );

    let verifier = Arc::new(DirectiveVerifier::from_base64(&config.trust_anchor));
    let runner = Arc::new(ShellRunner::default());
    let updater = Arc::new(Updater::new(
        config.release_url.clone(),
        RestartPolicy::ExitAfter(RESTART_GRACE),
    ));
    let engine = SessionEngine::new(
        config.endpoint.clone(),
        config.credentials.clone(),
        verifier,
        runner,
        updater,
    )
    .with_dial_timeout(config.dial_timeout);

    let heartbeat = HeartbeatEmitter::new(
        engine.outbound(),
        Arc::new(ProcStatsSampler::default()),
        HEARTBEAT_INTERVAL,
    )
    .spawn();

    tokio::select! {
        _ = engine.connect_forever() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
        }
    }

    heartbeat.abort();
    engine.shutdown().await;
    info!("agent stopped");
    Ok(())
}
