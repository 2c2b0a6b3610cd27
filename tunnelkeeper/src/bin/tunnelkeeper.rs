//! Main entry point for the tunnelkeeper control plane.

use std::env::var;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Arg, ArgMatches, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunnelkeeper::defaults::*;
use tunnelkeeper::edge::{CliEdgeProvider, EdgeProvider};
use tunnelkeeper::http::routes::AppState;
use tunnelkeeper::library::Library;
use tunnelkeeper::monitor::Monitor;
use tunnelkeeper::staging::StagingDir;
use tunnelkeeper::token::TokenService;
use tunnelkeeper::tunnel::TunnelManager;
use tunnelkeeper::{http, store, TunnelKeeperConf};
use utils::http::endpoint;
use utils::logging::{self, LogFormat};
use utils::signals;

fn main() -> anyhow::Result<()> {
    let arg_matches = cli().get_matches();

    let log_format = arg_or_env(&arg_matches, "log-format", "LOG_FORMAT")
        .unwrap_or_else(|| "plain".to_string())
        .parse::<LogFormat>()?;
    logging::init(log_format)?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    let conf = build_conf(&arg_matches)?;
    info!(
        "starting tunnelkeeper: library '{}', staging '{}', access log '{}'",
        conf.library_root, conf.staging_root, conf.access_log_path
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tunnelkeeper")
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    runtime.block_on(async_main(conf))
}

async fn async_main(conf: TunnelKeeperConf) -> anyhow::Result<()> {
    let conf = Arc::new(conf);

    let store = store::from_url(&conf.state_store_url)
        .await
        .context("connecting to state store")?;
    store
        .ping()
        .await
        .context("state store did not answer ping")?;

    let library = Library::open(&conf.library_root).context("opening library root")?;
    let staging = StagingDir::create(&conf.staging_root)
        .await
        .context("preparing staging root")?;
    let edge: Arc<dyn EdgeProvider> = Arc::new(CliEdgeProvider::new(
        conf.edge_command.clone(),
        conf.edge_timeout,
    ));

    let cancel = CancellationToken::new();
    let manager = Arc::new(TunnelManager::new(
        conf.clone(),
        store.clone(),
        edge,
        library,
        staging,
        cancel.clone(),
    ));
    let tokens = Arc::new(TokenService::new(
        &conf.jwt_secret,
        store.clone(),
        conf.max_tunnel_lifetime,
    )?);

    // Startup reconciliation: the store, the staging directory and the edge
    // provider must agree before we accept requests.
    let summary = manager
        .reconcile()
        .await
        .context("startup reconciliation")?;
    info!(
        "reconciled on startup: {} resumed, {} cleaned, {} orphan routes, {} orphan staging dirs",
        summary.resumed,
        summary.cleaned,
        summary.orphan_routes_removed,
        summary.orphan_staging_removed
    );

    let monitor = Arc::new(Monitor::new(
        conf.clone(),
        store.clone(),
        manager.clone(),
        tokens.clone(),
        cancel.clone(),
    ));
    // Resume from the persisted log offset only when tunnels actually
    // survived the restart; otherwise old log traffic is irrelevant.
    let start = monitor.start_position(summary.resumed > 0).await;

    let background = vec![
        tokio::spawn(monitor.clone().run_tail_loop(start)),
        tokio::spawn(monitor.clone().run_tick_loop()),
        tokio::spawn(monitor.clone().run_reconcile_loop()),
        tokio::spawn(monitor.clone().run_token_sweep_loop()),
    ];

    let state = Arc::new(AppState {
        conf: conf.clone(),
        store,
        manager: manager.clone(),
        tokens,
        monitor,
        started_at: Instant::now(),
    });
    let listener = std::net::TcpListener::bind(&conf.listen_http_addr)
        .with_context(|| format!("binding HTTP listener on {}", conf.listen_http_addr))?;
    info!("serving control API on {}", conf.listen_http_addr);

    let http_cancel = CancellationToken::new();
    let server = tokio::spawn(endpoint::serve(
        http::make_router(state),
        listener,
        http_cancel.clone(),
    ));

    let signal = signals::wait_for_shutdown().await?;
    info!("received {}, shutting down", signal.name());

    // Stop the monitor first so no trigger fires mid-shutdown, then drain
    // in-flight requests, then take every remaining tunnel down.
    cancel.cancel();
    http_cancel.cancel();
    match tokio::time::timeout(conf.http_shutdown_grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("HTTP server error: {e:#}"),
        Ok(Err(e)) => error!("HTTP server task panicked: {e}"),
        Err(_) => warn!(
            "HTTP server did not drain within {:?}",
            conf.http_shutdown_grace
        ),
    }
    for task in background {
        if let Err(e) = task.await {
            error!("background task panicked: {e}");
        }
    }

    match manager.destroy_all_live().await {
        Ok(destroyed) if destroyed > 0 => {
            info!("destroyed {destroyed} live tunnels on shutdown")
        }
        Ok(_) => {}
        Err(e) => error!("failed to destroy live tunnels on shutdown: {e:#}"),
    }

    info!("shutdown complete");
    Ok(())
}

fn arg_or_env(arg_matches: &ArgMatches, arg: &str, env: &str) -> Option<String> {
    arg_matches
        .get_one::<String>(arg)
        .cloned()
        .or_else(|| var(env).ok())
}

fn seconds_or_env(
    arg_matches: &ArgMatches,
    arg: &str,
    env: &str,
    default: u64,
) -> anyhow::Result<Duration> {
    let secs = match arg_or_env(arg_matches, arg, env) {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("{env} must be an integer number of seconds"))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

fn build_conf(arg_matches: &ArgMatches) -> anyhow::Result<TunnelKeeperConf> {
    let jwt_secret = match arg_or_env(arg_matches, "jwt-secret-file", "JWT_SECRET_FILE") {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("reading JWT secret from '{path}'"))?,
        None => var("JWT_SECRET")
            .context("JWT_SECRET (or --jwt-secret-file) is required")?
            .into_bytes(),
    };

    Ok(TunnelKeeperConf {
        listen_http_addr: arg_or_env(arg_matches, "listen-http", "TUNNELKEEPER_LISTEN_HTTP")
            .unwrap_or_else(|| DEFAULT_HTTP_LISTEN_ADDR.to_string()),
        library_root: Utf8PathBuf::from(
            arg_or_env(arg_matches, "library-root", "LIBRARY_ROOT")
                .unwrap_or_else(|| DEFAULT_LIBRARY_ROOT.to_string()),
        ),
        staging_root: Utf8PathBuf::from(
            arg_or_env(arg_matches, "staging-root", "STAGING_ROOT")
                .context("STAGING_ROOT (or --staging-root) is required")?,
        ),
        access_log_path: Utf8PathBuf::from(
            arg_or_env(arg_matches, "access-log", "ACCESS_LOG_PATH")
                .context("ACCESS_LOG_PATH (or --access-log) is required")?,
        ),
        state_store_url: arg_or_env(arg_matches, "state-store-url", "STATE_STORE_URL")
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        jwt_secret,
        edge_command: arg_or_env(arg_matches, "edge-command", "EDGE_COMMAND")
            .context("EDGE_COMMAND (or --edge-command) is required")?,
        edge_timeout: seconds_or_env(
            arg_matches,
            "edge-timeout",
            "EDGE_TIMEOUT_SECONDS",
            DEFAULT_EDGE_TIMEOUT_SECONDS,
        )?,
        max_tunnel_lifetime: seconds_or_env(
            arg_matches,
            "max-tunnel-seconds",
            "MAX_TUNNEL_SECONDS",
            DEFAULT_MAX_TUNNEL_SECONDS,
        )?,
        stall_timeout: seconds_or_env(
            arg_matches,
            "stall-timeout-seconds",
            "STALL_TIMEOUT_SECONDS",
            DEFAULT_STALL_TIMEOUT_SECONDS,
        )?,
        grace_period: seconds_or_env(
            arg_matches,
            "grace-period-seconds",
            "GRACE_PERIOD_SECONDS",
            DEFAULT_GRACE_PERIOD_SECONDS,
        )?,
        monitor_tick_interval: seconds_or_env(
            arg_matches,
            "monitor-tick-seconds",
            "MONITOR_TICK_SECONDS",
            DEFAULT_MONITOR_TICK_SECONDS,
        )?,
        reconcile_interval: seconds_or_env(
            arg_matches,
            "reconcile-interval-seconds",
            "RECONCILE_INTERVAL_SECONDS",
            DEFAULT_RECONCILE_INTERVAL_SECONDS,
        )?,
        token_sweep_interval: Duration::from_secs(DEFAULT_TOKEN_SWEEP_INTERVAL_SECONDS),
        http_shutdown_grace: Duration::from_secs(DEFAULT_HTTP_SHUTDOWN_GRACE_SECONDS),
        checkpoint_every_events: DEFAULT_CHECKPOINT_EVERY_EVENTS,
        checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECONDS),
        history_limit: DEFAULT_HISTORY_LIMIT,
        active_window: Duration::from_secs(DEFAULT_ACTIVE_WINDOW_SECONDS),
    })
}

fn cli() -> Command {
    Command::new("Tunnelkeeper control plane")
        .about("Provisions short-lived, single-use public download tunnels for library files")
        .arg(
            Arg::new("listen-http")
                .long("listen-http")
                .help(format!("control API listen address, default {DEFAULT_HTTP_LISTEN_ADDR}")),
        )
        .arg(
            Arg::new("library-root")
                .long("library-root")
                .help(format!("read-only root of shareable files, default {DEFAULT_LIBRARY_ROOT}")),
        )
        .arg(
            Arg::new("staging-root")
                .long("staging-root")
                .help("directory for per-tunnel staging references"),
        )
        .arg(
            Arg::new("access-log")
                .long("access-log")
                .help("static server access log to tail"),
        )
        .arg(
            Arg::new("state-store-url")
                .long("state-store-url")
                .help("redis:// URL (or memory:// for a single-process run)"),
        )
        .arg(
            Arg::new("edge-command")
                .long("edge-command")
                .help("edge provider CLI used to publish and unpublish routes"),
        )
        .arg(
            Arg::new("jwt-secret-file")
                .long("jwt-secret-file")
                .help("file holding the token signing secret (>= 32 bytes); JWT_SECRET env is used otherwise"),
        )
        .arg(
            Arg::new("edge-timeout")
                .long("edge-timeout")
                .help("per-invocation edge provider timeout, seconds"),
        )
        .arg(
            Arg::new("max-tunnel-seconds")
                .long("max-tunnel-seconds")
                .help(format!("upper bound on tunnel lifetime, default {DEFAULT_MAX_TUNNEL_SECONDS}")),
        )
        .arg(
            Arg::new("stall-timeout-seconds")
                .long("stall-timeout-seconds")
                .help(format!("idle threshold for stall detection, default {DEFAULT_STALL_TIMEOUT_SECONDS}")),
        )
        .arg(
            Arg::new("grace-period-seconds")
                .long("grace-period-seconds")
                .help(format!("post-completion route retention, default {DEFAULT_GRACE_PERIOD_SECONDS}")),
        )
        .arg(
            Arg::new("monitor-tick-seconds")
                .long("monitor-tick-seconds")
                .help(format!("trigger evaluation period, default {DEFAULT_MONITOR_TICK_SECONDS}")),
        )
        .arg(
            Arg::new("reconcile-interval-seconds")
                .long("reconcile-interval-seconds")
                .help(format!("periodic reconcile interval, default {DEFAULT_RECONCILE_INTERVAL_SECONDS}")),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .help("log output format, 'plain' or 'json'"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }
}
