//! Download monitor: consumes the access log, attributes bytes to tunnels,
//! and fires the lifecycle triggers (completed / stalled / expired / grace
//! elapsed) that end a tunnel's life.
//!
//! The monitor never propagates errors to callers. Failures are logged,
//! counted, and retried; the periodic reconcile pass is the backstop for
//! anything that slips through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utils::id::TunnelId;

use crate::access_log::{
    classify_path, parse_line, AccessLogEvent, LogPosition, LogTailer, RouteKind, StartPosition,
};
use crate::metrics::{
    ACCESS_LOG_CHECKPOINTS, ACCESS_LOG_EVENTS, ACTIVE_TUNNELS, DOWNLOAD_BYTES, MONITOR_ERRORS,
    MONITOR_TICKS,
};
use crate::store::{CasOutcome, StateStore, StoreError};
use crate::token::TokenService;
use crate::tunnel::{
    record_key, requests_key, DestroyReason, TunnelManager, TunnelRecord, TunnelStatus,
};
use crate::TunnelKeeperConf;

pub const LOG_POSITION_KEY: &str = "monitor:log_position";

const TAIL_BATCH_LINES: usize = 500;
const TAIL_IDLE_SLEEP: std::time::Duration = std::time::Duration::from_millis(200);
const TAIL_ERROR_SLEEP: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Expired,
    Stalled,
    Completed,
    GraceElapsed,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TickSummary {
    pub evaluated: usize,
    pub completed: usize,
    pub stalled: usize,
    pub expired: usize,
    pub grace_destroyed: usize,
}

/// Decide which trigger, if any, fires for a tunnel at `now`. More-final
/// conditions win: expired over stalled over completed.
pub fn evaluate_triggers(
    record: &TunnelRecord,
    now: DateTime<Utc>,
    stall_timeout: std::time::Duration,
) -> Option<Trigger> {
    match record.status {
        TunnelStatus::Active | TunnelStatus::Provisioning => {
            if now > record.expires_at {
                return Some(Trigger::Expired);
            }
            if record.status == TunnelStatus::Provisioning {
                // A tunnel stuck in provisioning is reclaimed by expiry or
                // the reconciler, nothing else applies to it.
                return None;
            }
            if record.bytes_served > 0 {
                if let Some(last) = record.last_activity_at {
                    if now - last > ChronoDuration::from_std(stall_timeout).unwrap_or_else(|_| ChronoDuration::zero()) {
                        return Some(Trigger::Stalled);
                    }
                }
            }
            if record.bytes_served >= record.file_size && record.last_activity_at.is_some() {
                return Some(Trigger::Completed);
            }
            None
        }
        TunnelStatus::Completed => match record.grace_deadline {
            Some(deadline) if now > deadline => Some(Trigger::GraceElapsed),
            _ => None,
        },
        _ => None,
    }
}

pub struct Monitor {
    conf: Arc<TunnelKeeperConf>,
    store: Arc<dyn StateStore>,
    manager: Arc<TunnelManager>,
    tokens: Arc<TokenService>,
    cancel: CancellationToken,
    active: AtomicBool,
    parse_errors: AtomicU64,
    /// request_id -> last seen, per tunnel; the best-effort basis for the
    /// reported `active_connections`.
    recent_requests: Mutex<HashMap<TunnelId, HashMap<String, DateTime<Utc>>>>,
}

impl Monitor {
    pub fn new(
        conf: Arc<TunnelKeeperConf>,
        store: Arc<dyn StateStore>,
        manager: Arc<TunnelManager>,
        tokens: Arc<TokenService>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conf,
            store,
            manager,
            tokens,
            cancel,
            active: AtomicBool::new(false),
            parse_errors: AtomicU64::new(0),
            recent_requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Distinct request ids observed across all tunnels within the recency
    /// window. Reported, not relied on.
    pub fn active_downloads(&self) -> u64 {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.conf.active_window).unwrap_or_else(|_| ChronoDuration::zero());
        let recent = self.recent_requests.lock().unwrap();
        recent
            .values()
            .flat_map(|ids| ids.values())
            .filter(|seen| **seen >= cutoff)
            .count() as u64
    }

    /// Where the tailer should start: the persisted checkpoint when we are
    /// recovering tunnels from a previous life, the end of the log otherwise.
    pub async fn start_position(&self, resume: bool) -> StartPosition {
        if !resume {
            return StartPosition::End;
        }
        match self.store.get(LOG_POSITION_KEY).await {
            Ok(Some(raw)) => match raw.parse::<LogPosition>() {
                Ok(pos) => StartPosition::Checkpoint(pos),
                Err(e) => {
                    warn!("discarding malformed log checkpoint '{raw}': {e}");
                    StartPosition::End
                }
            },
            Ok(None) => StartPosition::End,
            Err(e) => {
                warn!("could not load log checkpoint: {e}");
                StartPosition::End
            }
        }
    }

    /// Apply one access-log event: attribute it to a tunnel and advance the
    /// byte accounting. Courtesy-page hits never count towards
    /// `bytes_served`; only the download route does.
    pub async fn apply_event(&self, event: &AccessLogEvent) -> Result<(), StoreError> {
        let (kind, tunnel_id) = match classify_path(&event.path) {
            Some(attributed) => attributed,
            None => {
                ACCESS_LOG_EVENTS.with_label_values(&["unrelated"]).inc();
                return Ok(());
            }
        };

        if kind == RouteKind::Courtesy {
            ACCESS_LOG_EVENTS.with_label_values(&["courtesy"]).inc();
            return Ok(());
        }
        if !matches!(event.status, 200 | 206) {
            ACCESS_LOG_EVENTS.with_label_values(&["ignored_status"]).inc();
            return Ok(());
        }

        let key = record_key(tunnel_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            // Event for a tunnel we already destroyed; nothing to account.
            ACCESS_LOG_EVENTS.with_label_values(&["unknown_tunnel"]).inc();
            return Ok(());
        }
        let file_size: u64 = fields
            .get("file_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let bytes_served: u64 = fields
            .get("bytes_served")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        // Range requests overlap and retries resend; cap the increment so
        // accounting never runs past the file size.
        let increment = event.body_bytes_sent.min(file_size.saturating_sub(bytes_served));
        if increment > 0 {
            self.store
                .hash_incr_by(&key, "bytes_served", increment as i64)
                .await?;
            DOWNLOAD_BYTES.inc_by(increment);
        }

        let last_activity = fields
            .get("last_activity_at")
            .filter(|v| !v.is_empty())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        if last_activity.map(|t| event.timestamp > t).unwrap_or(true) {
            self.store
                .hash_set(&key, &[("last_activity_at", event.timestamp.to_rfc3339())])
                .await?;
        }

        let requests = requests_key(tunnel_id);
        self.store.set_add(&requests, &event.request_id).await?;
        // Bound the set's life in case teardown never gets to delete it.
        self.store
            .expire(&requests, self.conf.max_tunnel_lifetime + self.conf.grace_period)
            .await?;
        self.recent_requests
            .lock()
            .unwrap()
            .entry(tunnel_id)
            .or_default()
            .insert(event.request_id.clone(), event.timestamp);

        ACCESS_LOG_EVENTS.with_label_values(&["download"]).inc();
        debug!(
            "tunnel {tunnel_id}: +{increment} bytes ({} -> {})",
            bytes_served,
            bytes_served + increment
        );
        Ok(())
    }

    /// One trigger-evaluation pass over every tunnel record. Also refreshes
    /// the reported connection estimates and the active-tunnels gauge.
    pub async fn tick_once(&self) -> anyhow::Result<TickSummary> {
        let now = Utc::now();
        let mut summary = TickSummary::default();
        self.prune_recent(now);

        let records = self.manager.list_records().await?;
        let mut live = 0i64;
        for record in &records {
            if !record.status.is_terminal() || record.status == TunnelStatus::Completed {
                live += 1;
            }
            summary.evaluated += 1;

            match evaluate_triggers(record, now, self.conf.stall_timeout) {
                Some(Trigger::Expired) => {
                    info!("tunnel {} expired", record.tunnel_id);
                    self.manager
                        .destroy_tunnel(record.tunnel_id, DestroyReason::Expired)
                        .await?;
                    summary.expired += 1;
                }
                Some(Trigger::Stalled) => {
                    info!(
                        "tunnel {} stalled at {}/{} bytes",
                        record.tunnel_id, record.bytes_served, record.file_size
                    );
                    self.manager
                        .destroy_tunnel(record.tunnel_id, DestroyReason::Stalled)
                        .await?;
                    summary.stalled += 1;
                }
                Some(Trigger::Completed) => {
                    self.mark_completed(record, now).await?;
                    summary.completed += 1;
                }
                Some(Trigger::GraceElapsed) => {
                    info!("grace period of tunnel {} elapsed", record.tunnel_id);
                    self.manager
                        .destroy_tunnel(record.tunnel_id, DestroyReason::Completed)
                        .await?;
                    summary.grace_destroyed += 1;
                }
                None => {
                    self.refresh_connection_estimate(record, now).await?;
                }
            }
        }

        ACTIVE_TUNNELS.set(live);
        MONITOR_TICKS.with_label_values(&["ok"]).inc();
        Ok(summary)
    }

    /// Completion keeps the route up for the grace period; actual teardown
    /// happens when the grace deadline passes.
    async fn mark_completed(
        &self,
        record: &TunnelRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let key = record_key(record.tunnel_id);
        match self
            .store
            .hash_compare_and_set(
                &key,
                "status",
                TunnelStatus::Active.as_str(),
                TunnelStatus::Completed.as_str(),
            )
            .await?
        {
            CasOutcome::Swapped => {
                let deadline = now
                    + ChronoDuration::from_std(self.conf.grace_period).unwrap_or_else(|_| ChronoDuration::zero());
                self.store
                    .hash_set(&key, &[("grace_deadline", deadline.to_rfc3339())])
                    .await?;
                info!(
                    "tunnel {} completed ({} bytes), route retained until {deadline}",
                    record.tunnel_id, record.file_size
                );
            }
            // Lost the race against expiry or an admin; their transition wins.
            CasOutcome::Mismatch { current } => {
                debug!(
                    "tunnel {} became {current} before completion could be recorded",
                    record.tunnel_id
                );
            }
            CasOutcome::Missing => {}
        }
        Ok(())
    }

    async fn refresh_connection_estimate(
        &self,
        record: &TunnelRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if record.status != TunnelStatus::Active {
            return Ok(());
        }
        let cutoff =
            now - ChronoDuration::from_std(self.conf.active_window).unwrap_or_else(|_| ChronoDuration::zero());
        let estimate = {
            let recent = self.recent_requests.lock().unwrap();
            recent
                .get(&record.tunnel_id)
                .map(|ids| ids.values().filter(|seen| **seen >= cutoff).count())
                .unwrap_or(0)
        } as u64;
        if estimate != record.active_connections {
            self.store
                .hash_set(
                    &record_key(record.tunnel_id),
                    &[("active_connections", estimate.to_string())],
                )
                .await?;
        }
        Ok(())
    }

    fn prune_recent(&self, now: DateTime<Utc>) {
        let cutoff = now
            - ChronoDuration::from_std(self.conf.active_window).unwrap_or_else(|_| ChronoDuration::zero())
            - ChronoDuration::seconds(60);
        let mut recent = self.recent_requests.lock().unwrap();
        for ids in recent.values_mut() {
            ids.retain(|_, seen| *seen >= cutoff);
        }
        recent.retain(|_, ids| !ids.is_empty());
    }

    /// Trigger-evaluation loop; ticks every `monitor_tick_interval`. Pauses
    /// with backoff while the state store is unavailable.
    pub async fn run_tick_loop(self: Arc<Self>) {
        const MAX_BACKOFF_SECS: f64 = 60.0;
        let mut error_run_count: u32 = 0;
        self.active.store(true, Ordering::Relaxed);

        loop {
            let sleep_duration = match self.tick_once().await {
                Ok(summary) => {
                    error_run_count = 0;
                    if summary.completed + summary.stalled + summary.expired
                        + summary.grace_destroyed
                        > 0
                    {
                        debug!("tick summary: {summary:?}");
                    }
                    self.conf.monitor_tick_interval
                }
                Err(e) => {
                    error_run_count += 1;
                    MONITOR_TICKS.with_label_values(&["error"]).inc();
                    MONITOR_ERRORS.inc();
                    let wait = utils::backoff::exponential_backoff_duration_seconds(
                        error_run_count,
                        self.conf.monitor_tick_interval.as_secs_f64().max(1.0),
                        MAX_BACKOFF_SECS,
                    );
                    error!("monitor tick failed {error_run_count} times, pausing {wait:.0}s: {e:#}");
                    std::time::Duration::from_secs_f64(wait)
                }
            };

            if tokio::time::timeout(sleep_duration, self.cancel.cancelled())
                .await
                .is_ok()
            {
                break;
            }
        }
        self.active.store(false, Ordering::Relaxed);
    }

    /// Log-tailing loop. Opens the access log (waiting for it to appear if
    /// necessary), then drains lines and checkpoints the offset every
    /// `checkpoint_every_events` events or `checkpoint_interval`.
    pub async fn run_tail_loop(self: Arc<Self>, start: StartPosition) {
        let mut tailer = loop {
            match LogTailer::open(&self.conf.access_log_path, start).await {
                Ok(tailer) => break tailer,
                Err(e) => {
                    warn!(
                        "cannot open access log '{}': {e:#}, retrying",
                        self.conf.access_log_path
                    );
                    if tokio::time::timeout(TAIL_ERROR_SLEEP, self.cancel.cancelled())
                        .await
                        .is_ok()
                    {
                        return;
                    }
                }
            }
        };
        info!(
            "tailing access log '{}' from {}",
            self.conf.access_log_path,
            tailer.checkpoint()
        );
        self.persist_checkpoint(&tailer).await;

        let mut events_since_checkpoint: u64 = 0;
        let mut last_checkpoint = Instant::now();

        while !self.cancel.is_cancelled() {
            let lines = match tailer.poll_lines(TAIL_BATCH_LINES).await {
                Ok(lines) => lines,
                Err(e) => {
                    error!("error reading access log: {e:#}");
                    MONITOR_ERRORS.inc();
                    if tokio::time::timeout(TAIL_ERROR_SLEEP, self.cancel.cancelled())
                        .await
                        .is_ok()
                    {
                        break;
                    }
                    continue;
                }
            };

            for line in &lines {
                match parse_line(line) {
                    Ok(event) => {
                        if let Err(e) = self.apply_event(&event).await {
                            error!("failed to apply access log event: {e:#}");
                            MONITOR_ERRORS.inc();
                        }
                        events_since_checkpoint += 1;
                    }
                    Err(_) => {
                        self.parse_errors.fetch_add(1, Ordering::Relaxed);
                        ACCESS_LOG_EVENTS.with_label_values(&["unparseable"]).inc();
                    }
                }
            }

            if events_since_checkpoint >= self.conf.checkpoint_every_events
                || last_checkpoint.elapsed() >= self.conf.checkpoint_interval
            {
                self.persist_checkpoint(&tailer).await;
                events_since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }

            if lines.is_empty()
                && tokio::time::timeout(TAIL_IDLE_SLEEP, self.cancel.cancelled())
                    .await
                    .is_ok()
            {
                break;
            }
        }
        self.persist_checkpoint(&tailer).await;
    }

    async fn persist_checkpoint(&self, tailer: &LogTailer) {
        let pos = tailer.checkpoint();
        match self.store.set(LOG_POSITION_KEY, &pos.to_string(), None).await {
            Ok(()) => {
                ACCESS_LOG_CHECKPOINTS.inc();
            }
            Err(e) => {
                warn!("failed to persist log checkpoint {pos}: {e:#}");
                MONITOR_ERRORS.inc();
            }
        }
    }

    /// Periodic reconcile pass, the backstop for partial teardown failures.
    pub async fn run_reconcile_loop(self: Arc<Self>) {
        loop {
            if tokio::time::timeout(self.conf.reconcile_interval, self.cancel.cancelled())
                .await
                .is_ok()
            {
                return;
            }
            match self.manager.reconcile().await {
                Ok(summary) => {
                    if summary.cleaned + summary.orphan_routes_removed
                        + summary.orphan_staging_removed
                        > 0
                    {
                        info!("periodic reconcile: {summary:?}");
                    }
                }
                Err(e) => {
                    warn!("periodic reconcile failed: {e:#}");
                    MONITOR_ERRORS.inc();
                }
            }
        }
    }

    /// Periodic sweep of expired token records.
    pub async fn run_token_sweep_loop(self: Arc<Self>) {
        loop {
            if tokio::time::timeout(self.conf.token_sweep_interval, self.cancel.cancelled())
                .await
                .is_ok()
            {
                return;
            }
            match self.tokens.sweep_expired().await {
                Ok(swept) if swept > 0 => info!("token sweep removed {swept} records"),
                Ok(_) => {}
                Err(e) => {
                    warn!("token sweep failed: {e:#}");
                    MONITOR_ERRORS.inc();
                }
            }
        }
    }

    /// `POST /admin/cleanup`: one forced tick plus a token sweep.
    pub async fn force_cleanup(&self) -> anyhow::Result<(TickSummary, u64)> {
        let summary = self.tick_once().await?;
        let swept = self.tokens.sweep_expired().await?;
        Ok((summary, swept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::AccessLogEvent;
    use crate::tunnel::tests::{fixture, Fixture};
    use std::time::Duration;

    fn monitor_for(f: &Fixture) -> Monitor {
        let conf = Arc::new(crate::TunnelKeeperConf::dummy());
        let tokens = Arc::new(
            TokenService::new(
                &conf.jwt_secret,
                f.store.clone(),
                conf.max_tunnel_lifetime,
            )
            .unwrap(),
        );
        Monitor::new(
            conf,
            f.store.clone(),
            f.manager.clone(),
            tokens,
            CancellationToken::new(),
        )
    }

    fn download_event(tunnel_id: &str, status: u16, body_bytes: u64) -> AccessLogEvent {
        AccessLogEvent {
            remote_addr: "203.0.113.9".to_string(),
            timestamp: Utc::now(),
            method: "GET".to_string(),
            path: format!("/download-file/{tunnel_id}/a.txt"),
            status,
            bytes_sent: body_bytes + 288,
            body_bytes_sent: body_bytes,
            user_agent: "curl/8.4.0".to_string(),
            request_time: 0.2,
            request_id: format!("req-{}", rand::random::<u32>()),
        }
    }

    fn synthetic_record(status: TunnelStatus) -> TunnelRecord {
        TunnelRecord {
            tunnel_id: "0a1b2c3d".parse().unwrap(),
            file_path: "a.txt".to_string(),
            file_size: 12,
            public_url: Some("https://x.edge.example".to_string()),
            hostname: Some("x.edge.example".to_string()),
            status,
            created_at: Utc::now() - ChronoDuration::seconds(100),
            expires_at: Utc::now() + ChronoDuration::seconds(100),
            grace_deadline: None,
            last_activity_at: None,
            bytes_served: 0,
            active_connections: 0,
        }
    }

    const STALL: Duration = Duration::from_secs(300);

    #[test]
    fn trigger_expired_wins_over_stalled_and_completed() {
        let mut record = synthetic_record(TunnelStatus::Active);
        record.expires_at = Utc::now() - ChronoDuration::seconds(1);
        record.bytes_served = 12;
        record.last_activity_at = Some(Utc::now() - ChronoDuration::seconds(600));
        assert_eq!(
            evaluate_triggers(&record, Utc::now(), STALL),
            Some(Trigger::Expired)
        );
    }

    #[test]
    fn trigger_stalled_wins_over_completed() {
        let mut record = synthetic_record(TunnelStatus::Active);
        record.bytes_served = 12;
        record.last_activity_at = Some(Utc::now() - ChronoDuration::seconds(600));
        assert_eq!(
            evaluate_triggers(&record, Utc::now(), STALL),
            Some(Trigger::Stalled)
        );
    }

    #[test]
    fn trigger_completed_needs_download_activity() {
        // A zero-byte file: bytes_served >= file_size from the start, but
        // completion must wait for the first successful GET.
        let mut record = synthetic_record(TunnelStatus::Active);
        record.file_size = 0;
        assert_eq!(evaluate_triggers(&record, Utc::now(), STALL), None);

        record.last_activity_at = Some(Utc::now());
        assert_eq!(
            evaluate_triggers(&record, Utc::now(), STALL),
            Some(Trigger::Completed)
        );
    }

    #[test]
    fn trigger_partial_download_keeps_waiting() {
        let mut record = synthetic_record(TunnelStatus::Active);
        record.bytes_served = 4;
        record.last_activity_at = Some(Utc::now());
        assert_eq!(evaluate_triggers(&record, Utc::now(), STALL), None);
    }

    #[test]
    fn trigger_grace_elapsed() {
        let mut record = synthetic_record(TunnelStatus::Completed);
        record.grace_deadline = Some(Utc::now() - ChronoDuration::seconds(1));
        assert_eq!(
            evaluate_triggers(&record, Utc::now(), STALL),
            Some(Trigger::GraceElapsed)
        );

        record.grace_deadline = Some(Utc::now() + ChronoDuration::seconds(100));
        assert_eq!(evaluate_triggers(&record, Utc::now(), STALL), None);
    }

    #[tokio::test]
    async fn bytes_are_counted_and_capped() {
        let f = fixture().await;
        let monitor = monitor_for(&f);
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        let id = record.tunnel_id.to_string();

        monitor
            .apply_event(&download_event(&id, 206, 5))
            .await
            .unwrap();
        let loaded = f.manager.get(record.tunnel_id).await.unwrap().unwrap();
        assert_eq!(loaded.bytes_served, 5);
        assert!(loaded.last_activity_at.is_some());

        // Overshoot from overlapping ranges is capped at the file size.
        monitor
            .apply_event(&download_event(&id, 200, 100))
            .await
            .unwrap();
        let loaded = f.manager.get(record.tunnel_id).await.unwrap().unwrap();
        assert_eq!(loaded.bytes_served, 12);
    }

    #[tokio::test]
    async fn courtesy_and_errors_do_not_count() {
        let f = fixture().await;
        let monitor = monitor_for(&f);
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        let id = record.tunnel_id.to_string();

        let mut courtesy = download_event(&id, 200, 640);
        courtesy.path = format!("/files/{id}/a.txt");
        monitor.apply_event(&courtesy).await.unwrap();

        monitor
            .apply_event(&download_event(&id, 404, 100))
            .await
            .unwrap();

        let loaded = f.manager.get(record.tunnel_id).await.unwrap().unwrap();
        assert_eq!(loaded.bytes_served, 0);
        assert_eq!(loaded.last_activity_at, None);
    }

    #[tokio::test]
    async fn full_download_completes_then_grace_destroys() {
        let f = fixture().await;
        let monitor = monitor_for(&f);
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        let id = record.tunnel_id;

        monitor
            .apply_event(&download_event(&id.to_string(), 200, 12))
            .await
            .unwrap();
        let summary = monitor.tick_once().await.unwrap();
        assert_eq!(summary.completed, 1);

        let loaded = f.manager.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TunnelStatus::Completed);
        assert!(loaded.grace_deadline.is_some());
        // Route stays up through the grace period.
        assert!(f.edge.routes.lock().unwrap().contains_key(&id));

        // Force the grace deadline into the past.
        f.store
            .hash_set(
                &record_key(id),
                &[(
                    "grace_deadline",
                    (Utc::now() - ChronoDuration::seconds(1)).to_rfc3339(),
                )],
            )
            .await
            .unwrap();
        let summary = monitor.tick_once().await.unwrap();
        assert_eq!(summary.grace_destroyed, 1);
        assert!(f.manager.get(id).await.unwrap().is_none());
        assert!(!f.edge.routes.lock().unwrap().contains_key(&id));
    }

    #[tokio::test]
    async fn stalled_tunnel_is_destroyed() {
        let f = fixture().await;
        let monitor = monitor_for(&f);
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(3600))
            .await
            .unwrap();
        let id = record.tunnel_id;

        f.store
            .hash_set(
                &record_key(id),
                &[
                    ("bytes_served", "4".to_string()),
                    (
                        "last_activity_at",
                        (Utc::now() - ChronoDuration::seconds(600)).to_rfc3339(),
                    ),
                ],
            )
            .await
            .unwrap();

        let summary = monitor.tick_once().await.unwrap();
        assert_eq!(summary.stalled, 1);
        assert!(f.manager.get(id).await.unwrap().is_none());
        let history = f.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, DestroyReason::Stalled);
        assert_eq!(history[0].bytes_served, 4);
    }

    #[tokio::test]
    async fn expired_tunnel_is_destroyed() {
        let f = fixture().await;
        let monitor = monitor_for(&f);
        let record = f
            .manager
            .create_tunnel("a.txt", Duration::from_secs(120))
            .await
            .unwrap();
        let id = record.tunnel_id;

        f.store
            .hash_set(
                &record_key(id),
                &[(
                    "expires_at",
                    (Utc::now() - ChronoDuration::seconds(1)).to_rfc3339(),
                )],
            )
            .await
            .unwrap();

        let summary = monitor.tick_once().await.unwrap();
        assert_eq!(summary.expired, 1);
        let history = f.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, DestroyReason::Expired);
    }

    #[tokio::test]
    async fn force_cleanup_ticks_and_sweeps() {
        let f = fixture().await;
        let monitor = monitor_for(&f);
        let (summary, swept) = monitor.force_cleanup().await.unwrap();
        assert_eq!(summary.evaluated, 0);
        assert_eq!(swept, 0);
    }
}
