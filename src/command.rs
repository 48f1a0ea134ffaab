//! Relay-pushed device commands
//!
//! The relay may push `COMMAND` frames carrying JSON:
//!
//! ```json
//! {"id": "c-17", "type": "rotate_ip", "payload": {}}
//! ```

use crate::context::GatewayContext;
use crate::network::{NetworkError, TransportKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Time allowed for the cellular network to come back after a rotation
const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// Command errors
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid command JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown command type: {0}")]
    Unknown(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DeviceCommand {
    pub fn parse(json: &[u8]) -> Result<Self, CommandError> {
        Ok(serde_json::from_slice(json)?)
    }
}

/// Executes commands against the gateway context
pub struct CommandExecutor {
    ctx: GatewayContext,
    settle: Duration,
}

impl CommandExecutor {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            settle: DEFAULT_SETTLE,
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Run one command, returning a human readable result
    pub async fn execute(&self, command: &DeviceCommand) -> Result<String, CommandError> {
        match command.kind.as_str() {
            "rotate_ip" => self.rotate_ip().await,
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    async fn rotate_ip(&self) -> Result<String, CommandError> {
        let network = self.ctx.network();
        let mut state = network.subscribe(TransportKind::Cellular);
        network.reconnect_cellular()?;

        let back = tokio::time::timeout(self.settle, state.wait_for(|s| s.is_connected())).await;
        match back {
            Ok(Ok(state)) => Ok(format!(
                "IP rotation complete (network {})",
                state.handle().map(|h| h.id()).unwrap_or_default()
            )),
            _ => Ok("IP rotation initiated".to_string()),
        }
    }

    /// Execute commands from `commands` until shutdown
    pub async fn run(self, mut commands: mpsc::Receiver<DeviceCommand>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match self.execute(&command).await {
                Ok(result) => info!("Command {} ({}) succeeded: {}", command.id, command.kind, result),
                Err(e) => warn!("Command {} ({}) failed: {}", command.id, command.kind, e),
            }
        }
    }
}
