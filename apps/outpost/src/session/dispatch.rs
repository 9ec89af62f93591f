use std::sync::Arc;

use outpost_proto::{AgentMessage, Directive};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::Outbound;
use crate::auth::DirectiveVerifier;
use crate::exec::CommandRunner;
use crate::update::SelfUpdate;

/// Upper bound on detached command executions running at once.
pub const MAX_INFLIGHT_COMMANDS: usize = 32;

pub const UPGRADE_NOTICE: &str = "Upgrading agent...";

/// Routes decoded directives to the component that handles them.
///
/// Directives are handled one at a time in arrival order. Verified commands
/// run on their own task, so a slow command never holds up the read loop,
/// and their results come back through the shared [`Outbound`].
pub struct Dispatcher {
    verifier: Arc<DirectiveVerifier>,
    runner: Arc<dyn CommandRunner>,
    updater: Arc<dyn SelfUpdate>,
    outbound: Arc<Outbound>,
    version: String,
    inflight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        verifier: Arc<DirectiveVerifier>,
        runner: Arc<dyn CommandRunner>,
        updater: Arc<dyn SelfUpdate>,
        outbound: Arc<Outbound>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            runner,
            updater,
            outbound,
            version: version.into(),
            inflight: Arc::new(Semaphore::new(MAX_INFLIGHT_COMMANDS)),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_command_limit(mut self, limit: usize) -> Self {
        self.inflight = Arc::new(Semaphore::new(limit));
        self
    }

    pub async fn handle(&self, directive: Directive) {
        match directive {
            Directive::Status { content } => info!(%content, "server status"),
            Directive::Pong => {}
            Directive::Upgrade => self.upgrade().await,
            Directive::Command {
                content,
                timestamp,
                signature,
            } => self.command(content, timestamp, &signature).await,
            Directive::Unknown { kind } => warn!(%kind, "ignoring unrecognised directive"),
        }
    }

    /// Runs inline: the process is about to restart either way, so blocking
    /// further reads here is fine.
    async fn upgrade(&self) {
        info!(version = %self.version, "upgrade requested");
        self.notify(AgentMessage::status(UPGRADE_NOTICE)).await;
        if let Err(err) = self.updater.update(&self.version).await {
            error!(error = %err, "update failed");
            self.notify(AgentMessage::error(format!("Update failed: {err}")))
                .await;
        }
    }

    async fn command(&self, content: String, timestamp: i64, signature: &str) {
        info!(%content, timestamp, "received command");
        if !self.verifier.verify(&content, timestamp, signature) {
            return;
        }

        let Ok(permit) = self.inflight.clone().try_acquire_owned() else {
            warn!(%content, "too many commands in flight; refusing");
            self.notify(AgentMessage::command_result(
                "Error: too many commands in flight",
            ))
            .await;
            return;
        };

        info!("signature verified, executing command");
        let runner = self.runner.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let execution = tokio::spawn(async move { runner.run(&content).await });
            let output = match execution.await {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    warn!(error = %err, "command execution failed");
                    format!("Error: {err}")
                }
                Err(err) => {
                    error!(error = %err, "command task did not complete");
                    format!("Error: {err}")
                }
            };
            if let Err(err) = outbound.send(&AgentMessage::command_result(output)).await {
                warn!(error = %err, "could not deliver command result");
            }
        });
    }

    async fn notify(&self, message: AgentMessage) {
        if let Err(err) = self.outbound.send(&message).await {
            warn!(error = %err, "could not deliver notice");
        }
    }
}
