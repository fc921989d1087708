//! Container lifecycle management: launch, health checks, scoped ownership.
//!
//! One backing-service container is shared by every test process in a
//! session. Whoever finds the service unreachable launches it; a launch
//! that loses the port race simply falls through to healthcheck retries
//! against the winner's container. Only the acquisition that launched a
//! container kills it on scope exit.

use std::process::Command;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::containers::cleanup;
use crate::error::{Error, Result};

/// Healthcheck retry budget before the session is declared unstartable.
const HEALTHCHECK_ATTEMPTS: u32 = 40;

/// Fixed backoff between healthcheck attempts.
const HEALTHCHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Check if Docker is available on the system.
pub fn is_docker_available() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Raised by a healthcheck when the backing service is not serving yet.
#[derive(Debug)]
pub struct Unreachable(pub String);

/// Resource-kind-specific probe confirming the backing service is
/// reachable and serving. Supplied by the caller; the engine only knows
/// the retry protocol.
#[async_trait]
pub trait Healthcheck: Send + Sync {
    async fn probe(&self, config: &ServiceConfig) -> std::result::Result<(), Unreachable>;
}

/// Postgres probe: connect with a short timeout and run a trivial query.
pub struct PostgresHealthcheck;

#[async_trait]
impl Healthcheck for PostgresHealthcheck {
    async fn probe(&self, config: &ServiceConfig) -> std::result::Result<(), Unreachable> {
        let root_url = config.root_url();
        let connect = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(1))
            .connect(&root_url);

        match timeout(Duration::from_secs(2), connect).await {
            Ok(Ok(pool)) => match sqlx::query("SELECT 1").fetch_one(&pool).await {
                Ok(_) => Ok(()),
                Err(e) => Err(Unreachable(e.to_string())),
            },
            Ok(Err(e)) => Err(Unreachable(e.to_string())),
            Err(_) => Err(Unreachable("connection attempt timed out".to_string())),
        }
    }
}

/// Result of a launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A new container was started by this process.
    Started(String),
    /// Another process won the launch race for the configured port.
    PortTaken,
}

/// Launch a detached, auto-removing container for the configured service.
///
/// The container id is registered with the cleanup coordinator before this
/// returns, so a crashed process cannot orphan it.
pub fn launch(config: &ServiceConfig) -> Result<LaunchOutcome> {
    let mut cmd = Command::new("docker");
    cmd.args(["run", "-d", "--rm"]);
    cmd.arg("-p");
    cmd.arg(format!(
        "{}:{}",
        config.effective_port(),
        config.container_port()
    ));
    for (key, value) in config.container_env() {
        cmd.arg("-e");
        cmd.arg(format!("{key}={value}"));
    }
    cmd.arg(config.image());

    let output = cmd
        .output()
        .map_err(|e| Error::ContainerLaunch(e.to_string()))?;

    if output.status.success() {
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("started {} container {}", config.kind(), id);
        cleanup::register(&id)?;
        return Ok(LaunchOutcome::Started(id));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_port_race(&stderr) {
        debug!(
            "lost the launch race for port {}, reusing the winner's container",
            config.effective_port()
        );
        return Ok(LaunchOutcome::PortTaken);
    }

    Err(Error::ContainerLaunch(stderr.trim().to_string()))
}

fn is_port_race(stderr: &str) -> bool {
    stderr.contains("port is already allocated") || stderr.contains("address already in use")
}

/// Kill a container. Callers decide which failures to tolerate.
pub(crate) fn kill_container(id: &str) -> anyhow::Result<()> {
    let output = Command::new("docker").args(["kill", id]).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("docker kill {}: {}", id, stderr.trim());
    }
    Ok(())
}

/// Scoped ownership of a running backing-service container.
///
/// Killing on drop happens iff this acquisition launched the container; a
/// reused container is never killed by the reuser.
#[derive(Debug)]
pub struct ContainerGuard {
    launched: Option<String>,
}

impl ContainerGuard {
    /// Id of the container this guard launched, if any.
    pub fn container_id(&self) -> Option<&str> {
        self.launched.as_deref()
    }

    /// Whether this acquisition launched the container it is guarding.
    pub fn launched_here(&self) -> bool {
        self.launched.is_some()
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.launched.take() {
            debug!("killing launched container {}", id);
            if let Err(e) = kill_container(&id) {
                warn!("failed to kill container {}: {:#}", id, e);
            }
        }
    }
}

/// Ensure a reachable backing service, launching a container on demand.
///
/// The healthcheck runs once up front; only if it reports [`Unreachable`]
/// does a launch happen. Healthcheck failures during the retry loop are
/// transparent; exhausting the budget is fatal and names the attempted
/// configuration.
pub async fn acquire<H>(config: &ServiceConfig, healthcheck: &H) -> Result<ContainerGuard>
where
    H: Healthcheck + ?Sized,
{
    match healthcheck.probe(config).await {
        Ok(()) => {
            debug!(
                "{} already reachable at {}:{}",
                config.kind(),
                config.host(),
                config.effective_port()
            );
            return Ok(ContainerGuard { launched: None });
        }
        Err(Unreachable(reason)) => {
            debug!("{} not reachable ({}), launching", config.kind(), reason);
        }
    }

    if !is_docker_available() {
        return Err(Error::ContainerLaunch(
            "docker is not available on this host".to_string(),
        ));
    }

    let launched = match launch(config)? {
        LaunchOutcome::Started(id) => Some(id),
        LaunchOutcome::PortTaken => None,
    };

    for attempt in 1..=HEALTHCHECK_ATTEMPTS {
        match healthcheck.probe(config).await {
            Ok(()) => {
                info!("{} healthy after {} attempt(s)", config.kind(), attempt);
                return Ok(ContainerGuard { launched });
            }
            Err(Unreachable(reason)) => {
                debug!(
                    "healthcheck {}/{} failed: {}",
                    attempt, HEALTHCHECK_ATTEMPTS, reason
                );
                sleep(HEALTHCHECK_INTERVAL).await;
            }
        }
    }

    // The launched id stays in the cleanup registry and is reaped at
    // session end.
    Err(Error::ContainerUnreachable {
        image: config.image().to_string(),
        host: config.host().to_string(),
        port: config.effective_port(),
        attempts: HEALTHCHECK_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_race_detection() {
        assert!(is_port_race(
            "docker: Error response from daemon: driver failed programming external \
             connectivity on endpoint sleepy_khayyam: Bind for 0.0.0.0:5532 failed: \
             port is already allocated."
        ));
        assert!(is_port_race("listen tcp 0.0.0.0:5532: address already in use"));
        assert!(!is_port_race("No such image: postgres:13-alpine"));
    }

    #[test]
    fn test_reused_container_is_not_killed() {
        // Dropping a guard for a reused container must not shell out.
        let guard = ContainerGuard { launched: None };
        assert!(!guard.launched_here());
        drop(guard);
    }
}
