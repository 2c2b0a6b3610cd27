//! Edge provider: the external service that turns a staging directory into
//! a publicly reachable HTTPS hostname.
//!
//! The provider is driven through its CLI: `<cmd> publish --id <id> <path>`,
//! `<cmd> unpublish --id <id>` and `<cmd> list --json`, each expected to
//! print JSON on stdout. Every invocation runs under a timeout and callers
//! retry transient failures with exponential backoff.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::warn;
use utils::id::TunnelId;

use crate::metrics::EDGE_OPERATIONS;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("edge provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("edge provider exited with {status}: {stderr}")]
    CommandFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("edge provider produced malformed output: {0}")]
    Malformed(String),
    #[error("failed to run edge provider: {0}")]
    Io(#[from] std::io::Error),
}

/// One published route, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishedRoute {
    #[serde(rename = "id")]
    pub tunnel_id: TunnelId,
    pub hostname: String,
    pub public_url: String,
}

#[async_trait]
pub trait EdgeProvider: Send + Sync + 'static {
    /// Publish `local_path` (a per-tunnel staging directory) and return the
    /// assigned hostname and base URL.
    async fn publish(
        &self,
        tunnel_id: TunnelId,
        local_path: &Utf8Path,
    ) -> Result<PublishedRoute, EdgeError>;

    /// Tear down the route. Safe to call for routes that are already gone.
    async fn unpublish(&self, tunnel_id: TunnelId) -> Result<(), EdgeError>;

    /// Routes the provider currently holds; used by reconciliation.
    async fn list_published(&self) -> Result<Vec<PublishedRoute>, EdgeError>;
}

pub struct CliEdgeProvider {
    command: String,
    timeout: Duration,
}

impl CliEdgeProvider {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    async fn run(&self, op: &'static str, args: &[&str]) -> Result<String, EdgeError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let result = tokio::time::timeout(self.timeout, async {
            let mut out = String::new();
            let mut err = String::new();
            let (status, _, _) = tokio::try_join!(
                child.wait(),
                stdout.read_to_string(&mut out),
                stderr.read_to_string(&mut err),
            )?;
            Ok::<_, std::io::Error>((status, out, err))
        })
        .await;

        let (status, out, err) = match result {
            Ok(inner) => inner?,
            Err(_elapsed) => {
                // kill_on_drop reaps the child when `child` goes out of scope
                EDGE_OPERATIONS.with_label_values(&[op, "timeout"]).inc();
                return Err(EdgeError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            EDGE_OPERATIONS.with_label_values(&[op, "error"]).inc();
            return Err(EdgeError::CommandFailed {
                status,
                stderr: err.trim().to_owned(),
            });
        }
        EDGE_OPERATIONS.with_label_values(&[op, "ok"]).inc();
        Ok(out)
    }
}

#[async_trait]
impl EdgeProvider for CliEdgeProvider {
    async fn publish(
        &self,
        tunnel_id: TunnelId,
        local_path: &Utf8Path,
    ) -> Result<PublishedRoute, EdgeError> {
        let id = tunnel_id.to_string();
        let out = self
            .run("publish", &["publish", "--id", &id, local_path.as_str()])
            .await?;
        let route = parse_publish_output(&out)?;
        if route.tunnel_id != tunnel_id {
            warn!(
                "edge provider answered for tunnel {} while publishing {tunnel_id}",
                route.tunnel_id
            );
        }
        Ok(route)
    }

    async fn unpublish(&self, tunnel_id: TunnelId) -> Result<(), EdgeError> {
        let id = tunnel_id.to_string();
        self.run("unpublish", &["unpublish", "--id", &id]).await?;
        Ok(())
    }

    async fn list_published(&self) -> Result<Vec<PublishedRoute>, EdgeError> {
        let out = self.run("list", &["list", "--json"]).await?;
        parse_list_output(&out)
    }
}

fn parse_publish_output(out: &str) -> Result<PublishedRoute, EdgeError> {
    serde_json::from_str(out.trim()).map_err(|e| EdgeError::Malformed(e.to_string()))
}

fn parse_list_output(out: &str) -> Result<Vec<PublishedRoute>, EdgeError> {
    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| EdgeError::Malformed(e.to_string()))
}
