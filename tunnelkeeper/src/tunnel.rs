//! Tunnel records and the manager that drives their lifecycle.
//!
//! A record lives in the state store as a hash under `tunnel:<id>`, so the
//! monitor can advance byte counters with plain atomic increments and status
//! transitions go through a field compare-and-set. Terminal statuses are
//! monotone: once a tunnel is completed/stalled/expired/terminated/failed,
//! the only remaining step is teardown and record deletion.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utils::backoff;
use utils::id::TunnelId;

use crate::edge::{EdgeError, EdgeProvider};
use crate::library::{Library, LibraryError};
use crate::metrics::{TUNNELS_CREATED, TUNNELS_DESTROYED};
use crate::staging::StagingDir;
use crate::store::{CasOutcome, StateStore, StoreError};
use crate::TunnelKeeperConf;

pub const HISTORY_KEY: &str = "tunnel:history";

const ID_ALLOC_ATTEMPTS: u32 = 5;
const EDGE_RETRY_ATTEMPTS: u32 = 3;
const EDGE_BACKOFF_BASE_SECONDS: f64 = 1.0;
const EDGE_BACKOFF_MAX_SECONDS: f64 = 4.0;
/// Teardown claims expire on their own, so a crash mid-teardown does not
/// wedge the tunnel; the reconciler retries after this.
const TEARDOWN_CLAIM_TTL: Duration = Duration::from_secs(60);

pub fn record_key(tunnel_id: TunnelId) -> String {
    format!("tunnel:{tunnel_id}")
}

pub fn requests_key(tunnel_id: TunnelId) -> String {
    format!("tunnel:{tunnel_id}:requests")
}

fn teardown_key(tunnel_id: TunnelId) -> String {
    format!("tunnel:{tunnel_id}:teardown")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Provisioning,
    Active,
    Completed,
    Stalled,
    Expired,
    Terminated,
    Failed,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Provisioning => "provisioning",
            TunnelStatus::Active => "active",
            TunnelStatus::Completed => "completed",
            TunnelStatus::Stalled => "stalled",
            TunnelStatus::Expired => "expired",
            TunnelStatus::Terminated => "terminated",
            TunnelStatus::Failed => "failed",
        }
    }

    /// Terminal statuses admit no further transition except record deletion.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TunnelStatus::Provisioning | TunnelStatus::Active)
    }
}

impl FromStr for TunnelStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "provisioning" => TunnelStatus::Provisioning,
            "active" => TunnelStatus::Active,
            "completed" => TunnelStatus::Completed,
            "stalled" => TunnelStatus::Stalled,
            "expired" => TunnelStatus::Expired,
            "terminated" => TunnelStatus::Terminated,
            "failed" => TunnelStatus::Failed,
            other => anyhow::bail!("unknown tunnel status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    Completed,
    Stalled,
    Expired,
    Terminated,
    Failed,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::Completed => "completed",
            DestroyReason::Stalled => "stalled",
            DestroyReason::Expired => "expired",
            DestroyReason::Terminated => "terminated",
            DestroyReason::Failed => "failed",
        }
    }

    fn terminal_status(&self) -> TunnelStatus {
        match self {
            DestroyReason::Completed => TunnelStatus::Completed,
            DestroyReason::Stalled => TunnelStatus::Stalled,
            DestroyReason::Expired => TunnelStatus::Expired,
            DestroyReason::Terminated => TunnelStatus::Terminated,
            DestroyReason::Failed => TunnelStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelRecord {
    pub tunnel_id: TunnelId,
    pub file_path: String,
    pub file_size: u64,
    pub public_url: Option<String>,
    pub hostname: Option<String>,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub grace_deadline: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub bytes_served: u64,
    pub active_connections: u64,
}

impl TunnelRecord {
    pub fn basename(&self) -> &str {
        self.file_path.rsplit('/').next().unwrap_or("file")
    }

    /// Path the static server serves the attachment under.
    pub fn download_path(&self) -> String {
        format!("/download-file/{}/{}", self.tunnel_id, self.basename())
    }

    /// Fully qualified single-use download URL, once the edge assigned one.
    pub fn download_url(&self) -> Option<String> {
        self.public_url
            .as_ref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), self.download_path()))
    }

    pub(crate) fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("tunnel_id", self.tunnel_id.to_string()),
            ("file_path", self.file_path.clone()),
            ("file_size", self.file_size.to_string()),
            (
                "public_url",
                self.public_url.clone().unwrap_or_default(),
            ),
            ("hostname", self.hostname.clone().unwrap_or_default()),
            ("status", self.status.as_str().to_string()),
            ("created_at", self.created_at.to_rfc3339()),
            ("expires_at", self.expires_at.to_rfc3339()),
            (
                "grace_deadline",
                self.grace_deadline.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            (
                "last_activity_at",
                self.last_activity_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            ),
            ("bytes_served", self.bytes_served.to_string()),
            ("active_connections", self.active_connections.to_string()),
        ]
    }

    pub(crate) fn from_fields(
        fields: &std::collections::HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        fn required<'m>(
            fields: &'m std::collections::HashMap<String, String>,
            name: &str,
        ) -> anyhow::Result<&'m str> {
            fields
                .get(name)
                .map(String::as_str)
                .with_context(|| format!("tunnel record is missing field '{name}'"))
        }
        fn optional(
            fields: &std::collections::HashMap<String, String>,
            name: &str,
        ) -> Option<String> {
            fields.get(name).filter(|v| !v.is_empty()).cloned()
        }
        fn timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
            Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
        }

        Ok(TunnelRecord {
            tunnel_id: required(fields, "tunnel_id")?
                .parse()
                .context("parsing tunnel_id")?,
            file_path: required(fields, "file_path")?.to_owned(),
            file_size: required(fields, "file_size")?
                .parse()
                .context("parsing file_size")?,
            public_url: optional(fields, "public_url"),
            hostname: optional(fields, "hostname"),
            status: required(fields, "status")?.parse()?,
            created_at: timestamp(required(fields, "created_at")?)?,
            expires_at: timestamp(required(fields, "expires_at")?)?,
            grace_deadline: optional(fields, "grace_deadline")
                .map(|v| timestamp(&v))
                .transpose()?,
            last_activity_at: optional(fields, "last_activity_at")
                .map(|v| timestamp(&v))
                .transpose()?,
            bytes_served: optional(fields, "bytes_served")
                .map(|v| v.parse())
                .transpose()
                .context("parsing bytes_served")?
                .unwrap_or(0),
            active_connections: optional(fields, "active_connections")
                .map(|v| v.parse())
                .transpose()
                .context("parsing active_connections")?
                .unwrap_or(0),
        })
    }
}

/// What a destroyed tunnel leaves behind for `GET /admin/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tunnel_id: TunnelId,
    pub file_path: String,
    pub file_size: u64,
    pub reason: DestroyReason,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: DateTime<Utc>,
    pub bytes_served: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateTunnelError {
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error("could not allocate a tunnel id after {ID_ALLOC_ATTEMPTS} attempts")]
    IdAllocation,
    #[error("failed to stage file: {0:#}")]
    Staging(anyhow::Error),
    #[error("edge provisioning failed: {0}")]
    EdgeProvision(String),
    #[error("shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// Another caller is tearing the tunnel down right now.
    InProgress,
    /// No record: the tunnel is already gone.
    AlreadyDestroyed,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ReconcileSummary {
    /// Live records whose edge route was confirmed.
    pub resumed: usize,
    /// Records destroyed or finished off because store/edge disagreed.
    pub cleaned: usize,
    pub orphan_routes_removed: usize,
    pub orphan_staging_removed: usize,
}

pub struct TunnelManager {
    conf: Arc<TunnelKeeperConf>,
    store: Arc<dyn StateStore>,
    edge: Arc<dyn EdgeProvider>,
    library: Library,
    staging: StagingDir,
    cancel: CancellationToken,
}

impl TunnelManager {
    pub fn new(
        conf: Arc<TunnelKeeperConf>,
        store: Arc<dyn StateStore>,
        edge: Arc<dyn EdgeProvider>,
        library: Library,
        staging: StagingDir,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conf,
            store,
            edge,
            library,
            staging,
            cancel,
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Stage a library file, publish it through the edge provider and record
    /// the tunnel. Any failure after the record exists tears the tunnel down
    /// again before the error is surfaced.
    pub async fn create_tunnel(
        &self,
        file_path: &str,
        ttl: Duration,
    ) -> Result<TunnelRecord, CreateTunnelError> {
        let file = self.library.resolve(file_path).await?;
        let ttl = ttl.min(self.conf.max_tunnel_lifetime);
        let now = Utc::now();

        let mut allocated = None;
        for _ in 0..ID_ALLOC_ATTEMPTS {
            let id = TunnelId::generate();
            if self
                .store
                .hash_set_if_absent(&record_key(id), "tunnel_id", &id.to_string())
                .await?
            {
                allocated = Some(id);
                break;
            }
        }
        let tunnel_id = allocated.ok_or(CreateTunnelError::IdAllocation)?;

        let record = TunnelRecord {
            tunnel_id,
            file_path: file.rel_path.clone(),
            file_size: file.size,
            public_url: None,
            hostname: None,
            status: TunnelStatus::Provisioning,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
            grace_deadline: None,
            last_activity_at: None,
            bytes_served: 0,
            active_connections: 0,
        };
        self.store
            .hash_set(&record_key(tunnel_id), &record.to_fields())
            .await?;

        if let Err(e) = self.staging.stage(tunnel_id, &file).await {
            self.cleanup_failed_creation(tunnel_id).await;
            return Err(CreateTunnelError::Staging(e));
        }

        let route = match self.publish_with_retries(tunnel_id).await {
            Ok(route) => route,
            Err(e) => {
                self.cleanup_failed_creation(tunnel_id).await;
                return Err(e);
            }
        };

        let key = record_key(tunnel_id);
        self.store
            .hash_set(
                &key,
                &[
                    ("public_url", route.public_url.clone()),
                    ("hostname", route.hostname.clone()),
                ],
            )
            .await?;
        match self
            .store
            .hash_compare_and_set(
                &key,
                "status",
                TunnelStatus::Provisioning.as_str(),
                TunnelStatus::Active.as_str(),
            )
            .await?
        {
            CasOutcome::Swapped => {}
            // Somebody (shutdown, admin) reached the record first; honor it.
            CasOutcome::Mismatch { current } => {
                warn!("tunnel {tunnel_id} was {current} before activation, aborting");
                self.cleanup_failed_creation(tunnel_id).await;
                return Err(CreateTunnelError::EdgeProvision(format!(
                    "tunnel reached status {current} during provisioning"
                )));
            }
            CasOutcome::Missing => {
                self.cleanup_failed_creation(tunnel_id).await;
                return Err(CreateTunnelError::EdgeProvision(
                    "tunnel record vanished during provisioning".to_string(),
                ));
            }
        }

        TUNNELS_CREATED.inc();
        info!(
            "created tunnel {tunnel_id} for '{}' ({} bytes) at {}",
            record.file_path, record.file_size, route.public_url
        );

        let mut record = record;
        record.public_url = Some(route.public_url);
        record.hostname = Some(route.hostname);
        record.status = TunnelStatus::Active;
        Ok(record)
    }

    async fn publish_with_retries(
        &self,
        tunnel_id: TunnelId,
    ) -> Result<crate::edge::PublishedRoute, CreateTunnelError> {
        let dir = self.staging.tunnel_dir(tunnel_id);
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CreateTunnelError::ShuttingDown);
            }
            match self.edge.publish(tunnel_id, &dir).await {
                Ok(route) => return Ok(route),
                Err(e @ EdgeError::Malformed(_)) => {
                    return Err(CreateTunnelError::EdgeProvision(e.to_string()))
                }
                Err(e) if attempt + 1 >= EDGE_RETRY_ATTEMPTS => {
                    return Err(CreateTunnelError::EdgeProvision(e.to_string()))
                }
                Err(e) => {
                    warn!("publish of tunnel {tunnel_id} failed (attempt {attempt}): {e:#}");
                }
            }
            attempt += 1;
            backoff::exponential_backoff(
                attempt,
                EDGE_BACKOFF_BASE_SECONDS,
                EDGE_BACKOFF_MAX_SECONDS,
                &self.cancel,
            )
            .await;
        }
    }

    async fn cleanup_failed_creation(&self, tunnel_id: TunnelId) {
        if let Err(e) = self.destroy_tunnel(tunnel_id, DestroyReason::Failed).await {
            error!("cleanup of half-provisioned tunnel {tunnel_id} failed: {e:#}");
        }
    }

    pub async fn get(&self, tunnel_id: TunnelId) -> Result<Option<TunnelRecord>, StoreError> {
        let fields = self.store.hash_get_all(&record_key(tunnel_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        match TunnelRecord::from_fields(&fields) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                error!("unreadable tunnel record {tunnel_id}: {e:#}");
                Ok(None)
            }
        }
    }

    /// All records still present in the store (terminal ones included until
    /// teardown deletes them), oldest first.
    pub async fn list_records(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.store.list_keys("tunnel:").await? {
            let id = match key
                .strip_prefix("tunnel:")
                .and_then(|rest| rest.parse::<TunnelId>().ok())
            {
                Some(id) => id,
                // history, request-id sets, teardown markers
                None => continue,
            };
            if let Some(record) = self.get(id).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub async fn list_active(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        Ok(self
            .list_records()
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal() || r.status == TunnelStatus::Completed)
            .collect())
    }

    pub async fn terminate(&self, tunnel_id: TunnelId) -> anyhow::Result<DestroyOutcome> {
        self.destroy_tunnel(tunnel_id, DestroyReason::Terminated)
            .await
    }

    /// Tear a tunnel down: move the status to its terminal value, unpublish
    /// the edge route, drop the staging directory, append a history entry
    /// and delete the record. Idempotent; concurrent callers race on a
    /// teardown claim and all but one back off.
    pub async fn destroy_tunnel(
        &self,
        tunnel_id: TunnelId,
        reason: DestroyReason,
    ) -> anyhow::Result<DestroyOutcome> {
        let key = record_key(tunnel_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(DestroyOutcome::AlreadyDestroyed);
        }
        let record = TunnelRecord::from_fields(&fields)
            .with_context(|| format!("reading tunnel record {tunnel_id} for destroy"))?;

        let mut status = record.status;
        while !status.is_terminal() {
            match self
                .store
                .hash_compare_and_set(
                    &key,
                    "status",
                    status.as_str(),
                    reason.terminal_status().as_str(),
                )
                .await?
            {
                CasOutcome::Swapped => status = reason.terminal_status(),
                CasOutcome::Mismatch { current } => {
                    status = current
                        .parse()
                        .with_context(|| format!("status of tunnel {tunnel_id}"))?;
                }
                CasOutcome::Missing => return Ok(DestroyOutcome::AlreadyDestroyed),
            }
        }

        if !self
            .store
            .set_if_absent(&teardown_key(tunnel_id), "1", Some(TEARDOWN_CLAIM_TTL))
            .await?
        {
            return Ok(DestroyOutcome::InProgress);
        }

        self.unpublish_with_retries(tunnel_id).await;

        if let Err(e) = self.staging.remove(tunnel_id).await {
            // The reconciler sweeps staging orphans, keep going.
            error!("failed to remove staging for tunnel {tunnel_id}: {e:#}");
        }

        // Re-read counters so history carries the final byte totals.
        let final_bytes = self
            .store
            .hash_get(&key, "bytes_served")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(record.bytes_served);
        let entry = HistoryEntry {
            tunnel_id,
            file_path: record.file_path.clone(),
            file_size: record.file_size,
            reason,
            created_at: record.created_at,
            destroyed_at: Utc::now(),
            bytes_served: final_bytes.min(record.file_size),
        };
        let json = serde_json::to_string(&entry).context("serializing history entry")?;
        self.store
            .list_push_trimmed(HISTORY_KEY, &json, self.conf.history_limit)
            .await?;

        self.store.delete(&key).await?;
        self.store.delete(&requests_key(tunnel_id)).await?;
        self.store.delete(&teardown_key(tunnel_id)).await?;

        TUNNELS_DESTROYED
            .with_label_values(&[reason.as_str()])
            .inc();
        info!(
            "destroyed tunnel {tunnel_id} ({}), served {}/{} bytes",
            reason.as_str(),
            entry.bytes_served,
            record.file_size
        );
        Ok(DestroyOutcome::Destroyed)
    }

    async fn unpublish_with_retries(&self, tunnel_id: TunnelId) {
        let mut attempt = 0;
        loop {
            match self.edge.unpublish(tunnel_id).await {
                Ok(()) => return,
                Err(e) if attempt + 1 >= EDGE_RETRY_ATTEMPTS => {
                    // Best effort: the record still goes terminal, the
                    // reconciler retries the route later.
                    warn!("unpublish of tunnel {tunnel_id} failed, giving up: {e:#}");
                    return;
                }
                Err(e) => {
                    warn!("unpublish of tunnel {tunnel_id} failed (attempt {attempt}): {e:#}");
                }
            }
            attempt += 1;
            backoff::exponential_backoff(
                attempt,
                EDGE_BACKOFF_BASE_SECONDS,
                EDGE_BACKOFF_MAX_SECONDS,
                &self.cancel,
            )
            .await;
        }
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let raw = self.store.list_range(HISTORY_KEY, limit).await?;
        Ok(raw
            .iter()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!("unreadable history entry: {e}");
                    None
                }
            })
            .collect())
    }

    /// Restore consistency between store, staging directory and edge
    /// provider. Run at startup and periodically as the backstop for every
    /// partial failure the teardown paths tolerate.
    pub async fn reconcile(&self) -> anyhow::Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let routes = self
            .edge
            .list_published()
            .await
            .context("listing published edge routes")?;
        let records = self.list_records().await?;

        for record in &records {
            let id = record.tunnel_id;
            let has_route = routes.iter().any(|r| r.tunnel_id == id);
            if record.status.is_terminal() && record.status != TunnelStatus::Completed {
                // Interrupted teardown: finish it under the original reason.
                let reason = match record.status {
                    TunnelStatus::Stalled => DestroyReason::Stalled,
                    TunnelStatus::Expired => DestroyReason::Expired,
                    TunnelStatus::Terminated => DestroyReason::Terminated,
                    _ => DestroyReason::Failed,
                };
                self.destroy_tunnel(id, reason).await?;
                summary.cleaned += 1;
            } else if !has_route {
                // Either the provider lost the route or a crash happened
                // mid-create before the route existed.
                info!("tunnel {id} has no edge route, cleaning up");
                self.destroy_tunnel(id, DestroyReason::Failed).await?;
                summary.cleaned += 1;
            } else {
                summary.resumed += 1;
            }
        }

        for route in &routes {
            let known = records.iter().any(|r| r.tunnel_id == route.tunnel_id);
            if !known {
                info!(
                    "unpublishing orphan edge route for {} ({})",
                    route.tunnel_id, route.hostname
                );
                self.unpublish_with_retries(route.tunnel_id).await;
                summary.orphan_routes_removed += 1;
            }
        }

        let live_after: Vec<TunnelId> = self
            .list_records()
            .await?
            .iter()
            .map(|r| r.tunnel_id)
            .collect();
        for staged in self.staging.list().await? {
            if !live_after.contains(&staged) {
                self.staging.remove(staged).await?;
                summary.orphan_staging_removed += 1;
            }
        }

        Ok(summary)
    }

    /// Clean-shutdown path: destroy whatever is still live.
    pub async fn destroy_all_live(&self) -> anyhow::Result<usize> {
        let mut destroyed = 0;
        for record in self.list_records().await? {
            if !record.status.is_terminal() || record.status == TunnelStatus::Completed {
                self.destroy_tunnel(record.tunnel_id, DestroyReason::Terminated)
                    .await?;
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::edge::PublishedRoute;
    use crate::store::MemStateStore;
    use async_trait::async_trait;
    use camino::Utf8Path;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Edge provider double: routes live in a map, failures are switchable.
    #[derive(Default)]
    pub(crate) struct MockEdge {
        pub routes: Mutex<HashMap<TunnelId, PublishedRoute>>,
        pub fail_publish: AtomicBool,
        pub fail_unpublish: AtomicBool,
    }

    #[async_trait]
    impl EdgeProvider for MockEdge {
        async fn publish(
            &self,
            tunnel_id: TunnelId,
            _local_path: &Utf8Path,
        ) -> Result<PublishedRoute, EdgeError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(EdgeError::Malformed("publish disabled".to_string()));
            }
            let route = PublishedRoute {
                tunnel_id,
                hostname: format!("{tunnel_id}.edge.example"),
                public_url: format!("https://{tunnel_id}.edge.example"),
            };
            self.routes.lock().unwrap().insert(tunnel_id, route.clone());
            Ok(route)
        }

        async fn unpublish(&self, tunnel_id: TunnelId) -> Result<(), EdgeError> {
            if self.fail_unpublish.load(Ordering::SeqCst) {
                return Err(EdgeError::Malformed("unpublish disabled".to_string()));
            }
            self.routes.lock().unwrap().remove(&tunnel_id);
            Ok(())
        }

        async fn list_published(&self) -> Result<Vec<PublishedRoute>, EdgeError> {
            Ok(self.routes.lock().unwrap().values().cloned().collect())
        }
    }

    pub(crate) struct Fixture {
        pub manager: Arc<TunnelManager>,
        pub store: Arc<dyn StateStore>,
        pub edge: Arc<MockEdge>,
        _library_dir: camino_tempfile::Utf8TempDir,
        _staging_dir: camino_tempfile::Utf8TempDir,
    }

    pub(crate) async fn fixture() -> Fixture {
        let library_dir = camino_tempfile::tempdir().unwrap();
        let staging_dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::write(library_dir.path().join("a.txt"), b"12 bytes....")
            .await
            .unwrap();

        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::default());
        let edge = Arc::new(MockEdge::default());
        let manager = Arc::new(TunnelManager::new(
            Arc::new(TunnelKeeperConf::dummy()),
            store.clone(),
            edge.clone(),
            Library::open(library_dir.path()).unwrap(),
            StagingDir::create(staging_dir.path()).await.unwrap(),
            CancellationToken::new(),
        ));
        Fixture {
            manager,
            store,
            edge,
            _library_dir: library_dir,
            _staging_dir: staging_dir,
        }
    }

    #[tokio::test]
    async fn create_tunnel_happy_path() {
        let f = fixture().await;
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(record.status, TunnelStatus::Active);
        assert_eq!(record.file_size, 12);
        assert!(record
            .download_url()
            .unwrap()
            .ends_with(&format!("/download-file/{}/a.txt", record.tunnel_id)));
        assert!(f.edge.routes.lock().unwrap().contains_key(&record.tunnel_id));

        let loaded = f.manager.get(record.tunnel_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TunnelStatus::Active);
        assert_eq!(loaded.file_path, "a.txt");
        assert_eq!(loaded.public_url, record.public_url);
        assert!(loaded.expires_at > loaded.created_at);
    }

    #[tokio::test]
    async fn create_tunnel_rejects_traversal() {
        let f = fixture().await;
        let err = f
            .manager
            .create_tunnel("../etc/passwd", Duration::from_secs(120))
            .await;
        assert!(matches!(err, Err(CreateTunnelError::Library(_))));
        assert!(f.manager.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_tunnel_cleans_up_on_publish_failure() {
        let f = fixture().await;
        f.edge.fail_publish.store(true, Ordering::SeqCst);

        let err = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await;
        assert!(matches!(err, Err(CreateTunnelError::EdgeProvision(_))));

        // Record and staging must be gone, failure recorded in history.
        assert!(f.manager.list_records().await.unwrap().is_empty());
        let history = f.manager.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, DestroyReason::Failed);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let f = fixture().await;
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();

        let first = f
            .manager
            .destroy_tunnel(record.tunnel_id, DestroyReason::Terminated)
            .await
            .unwrap();
        assert_eq!(first, DestroyOutcome::Destroyed);

        let second = f
            .manager
            .destroy_tunnel(record.tunnel_id, DestroyReason::Terminated)
            .await
            .unwrap();
        assert_eq!(second, DestroyOutcome::AlreadyDestroyed);

        assert!(f.edge.routes.lock().unwrap().is_empty());
        assert_eq!(f.manager.history(10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_survives_unpublish_failure() {
        let f = fixture().await;
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        f.edge.fail_unpublish.store(true, Ordering::SeqCst);

        let outcome = f
            .manager
            .destroy_tunnel(record.tunnel_id, DestroyReason::Expired)
            .await
            .unwrap();
        assert_eq!(outcome, DestroyOutcome::Destroyed);
        // Route leaked on purpose; the reconciler owns it now.
        assert_eq!(f.edge.routes.lock().unwrap().len(), 1);

        f.edge.fail_unpublish.store(false, Ordering::SeqCst);
        let summary = f.manager.reconcile().await.unwrap();
        assert_eq!(summary.orphan_routes_removed, 1);
        assert!(f.edge.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_cleans_routeless_records() {
        let f = fixture().await;
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        // Simulate the provider losing the route behind our back.
        f.edge.routes.lock().unwrap().clear();

        let summary = f.manager.reconcile().await.unwrap();
        assert_eq!(summary.cleaned, 1);
        assert_eq!(summary.resumed, 0);
        assert!(f.manager.get(record.tunnel_id).await.unwrap().is_none());
        let history = f.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, DestroyReason::Failed);
    }

    #[tokio::test]
    async fn reconcile_resumes_consistent_tunnels() {
        let f = fixture().await;
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();

        let summary = f.manager.reconcile().await.unwrap();
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.cleaned, 0);
        assert!(f.manager.get(record.tunnel_id).await.unwrap().is_some());
    }

    #[test]
    fn record_fields_roundtrip() {
        let record = TunnelRecord {
            tunnel_id: "0a1b2c3d".parse().unwrap(),
            file_path: "docs/a.txt".to_string(),
            file_size: 42,
            public_url: Some("https://x.edge.example".to_string()),
            hostname: Some("x.edge.example".to_string()),
            status: TunnelStatus::Completed,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            grace_deadline: Some(Utc::now() + chrono::Duration::seconds(120)),
            last_activity_at: None,
            bytes_served: 17,
            active_connections: 2,
        };
        let fields: HashMap<String, String> = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = TunnelRecord::from_fields(&fields).unwrap();
        assert_eq!(parsed.tunnel_id, record.tunnel_id);
        assert_eq!(parsed.status, TunnelStatus::Completed);
        assert_eq!(parsed.bytes_served, 17);
        assert_eq!(parsed.grace_deadline.is_some(), true);
        assert_eq!(parsed.last_activity_at, None);
    }

    #[tokio::test]
    async fn destroy_all_live_for_shutdown() {
        let f = fixture().await;
        f.manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        f.manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(f.manager.destroy_all_live().await.unwrap(), 2);
        assert!(f.manager.list_records().await.unwrap().is_empty());
        assert!(f.edge.routes.lock().unwrap().is_empty());
    }
}
