//! Docker-based disruption actuator
//!
//! Each fleet node runs in its own container. Disruptions map onto the
//! Docker CLI:
//!
//! - hang: `docker pause`, wait, `docker unpause`
//! - kill: `docker kill` (restarting is left to the container's restart policy)
//! - strain-cpu: `docker exec` of `parallelism` busy loops under `timeout`
//!
//! Hang and strain-cpu return only once the disruption is over, so stopping
//! the disruption loops never leaves a node paused or strained.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::collab::DisruptionActuator;
use crate::error::CollabError;
use crate::fleet::{Node, NodeId};

/// Exit status of coreutils `timeout` when the command ran out its time
const TIMEOUT_EXPIRED: i32 = 124;

/// Applies disruptions to the containers running fleet nodes
pub struct DockerActuator {
    containers: HashMap<NodeId, String>,
}

impl DockerActuator {
    /// Create an actuator from a node-to-container mapping
    pub fn new(containers: HashMap<NodeId, String>) -> Self {
        DockerActuator { containers }
    }

    fn container(&self, node: &Node) -> Result<&str, CollabError> {
        self.containers
            .get(&node.id)
            .map(String::as_str)
            .ok_or_else(|| CollabError::Command(format!("no container known for node {}", node.id)))
    }

    /// Run `docker <args>`; any exit status outside `accepted` is an error
    async fn docker(&self, args: &[&str], accepted: &[i32]) -> Result<(), CollabError> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| CollabError::Command(format!("failed to run docker {}: {}", args[0], e)))?;

        match output.status.code() {
            Some(code) if accepted.contains(&code) => Ok(()),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(CollabError::Command(format!(
                    "docker {} failed ({}): {}",
                    args.join(" "),
                    output.status,
                    stderr.trim()
                )))
            }
        }
    }
}

/// Shell script spinning `parallelism` busy loops until killed
fn busy_loops(parallelism: u32) -> String {
    format!(
        "for i in $(seq {}); do (while :; do :; done) & done; wait",
        parallelism
    )
}

#[async_trait]
impl DisruptionActuator for DockerActuator {
    async fn hang(&self, node: &Node, duration: Duration) -> Result<(), CollabError> {
        let container = self.container(node)?;
        self.docker(&["pause", container], &[0]).await?;
        debug!(node = %node.id, container, ms = duration.as_millis() as u64, "container paused");

        tokio::time::sleep(duration).await;

        let resumed = self.docker(&["unpause", container], &[0]).await;
        if let Err(e) = &resumed {
            warn!(node = %node.id, container, error = %e, "failed to unpause container");
        }
        resumed
    }

    async fn kill(&self, node: &Node) -> Result<(), CollabError> {
        let container = self.container(node)?;
        self.docker(&["kill", container], &[0]).await?;
        debug!(node = %node.id, container, "container killed");
        Ok(())
    }

    async fn strain_cpu(
        &self,
        node: &Node,
        parallelism: u32,
        duration: Duration,
    ) -> Result<(), CollabError> {
        let container = self.container(node)?;
        let seconds = duration.as_secs().max(1).to_string();
        let script = busy_loops(parallelism);

        debug!(node = %node.id, container, parallelism, seconds = %seconds, "straining cpu");
        self.docker(
            &["exec", container, "timeout", seconds.as_str(), "sh", "-c", script.as_str()],
            &[0, TIMEOUT_EXPIRED],
        )
        .await
    }
}
