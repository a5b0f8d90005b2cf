use std::sync::Arc;

use clap::{Arg, Command};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bulwark::metrics::spawn_metrics_server;
use bulwark::rate_limit::spawn_rate_limit_cleanup;
use bulwark::server::{ServerState, serve, shutdown_signal};
use bulwark::{
    Config, HealthChecker, IpRateLimiter, LoadBalancer, Metrics, UpstreamPool, build_https_client,
    tls,
};

fn cli() -> Command {
    Command::new("bulwark")
        .about("Layer-7 HTTP load-balancing reverse proxy")
        .arg(
            Arg::new("strategy")
                .long("strategy")
                .value_name("NAME")
                .help(
                    "Load balancing strategy (round_robin, least_connections, latency, \
                     consistent_hash); overrides LB_STRATEGY",
                ),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .help("Listen address; overrides LB_LISTEN_ADDR"),
        )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let matches = cli().get_matches();

    let mut config = Config::from_env();
    if let Some(strategy) = matches.get_one::<String>("strategy") {
        config.strategy = strategy.clone();
    }
    if let Some(listen) = matches.get_one::<String>("listen") {
        config.listen_addr = listen.clone();
    }

    let config = config.into_runtime().unwrap_or_else(|e| {
        error!(%e, "failed to load configuration");
        std::process::exit(1);
    });

    info!(
        listen = %config.listen_addr,
        upstreams = config.upstreams.len(),
        strategy = config.strategy.as_str(),
        health_interval = ?config.health.interval,
        health_timeout = ?config.health.timeout,
        breaker_max_failures = config.breaker.max_failures,
        breaker_open_timeout = ?config.breaker.open_timeout,
        metrics_enabled = config.metrics_enabled,
        rate_limiting = config.rate_limit.is_some(),
        request_limits = config.request_limits.is_some(),
        tls = config.tls.is_some(),
        "configuration loaded"
    );

    let metrics = Arc::new(Metrics::new().unwrap_or_else(|e| {
        error!(%e, "failed to initialize metrics");
        std::process::exit(1);
    }));

    let pool = UpstreamPool::from_validated(&config.upstreams, config.breaker);
    for upstream in pool.all() {
        metrics.set_backend_health(upstream.uri(), true);
    }
    let balancer = LoadBalancer::new(pool.clone(), config.strategy);

    let rate_limiter = config.rate_limit.as_ref().map(|rl| {
        IpRateLimiter::from_config(rl).unwrap_or_else(|e| {
            error!(%e, "invalid rate limit configuration");
            std::process::exit(1);
        })
    });

    let tls_acceptor = config.tls.as_ref().map(|tls_config| {
        tls::build_tls_acceptor(tls_config).unwrap_or_else(|e| {
            error!(%e, "failed to initialize TLS");
            std::process::exit(1);
        })
    });

    // Background tasks run until the stop flag flips after serve() returns.
    let (stop_tx, _) = tokio::sync::watch::channel(false);
    let stopped = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    let checker = HealthChecker::new(pool, &config.health, Arc::clone(&metrics));
    checker.spawn(stopped(stop_tx.subscribe()));
    info!("health checker started");

    if config.metrics_enabled {
        spawn_metrics_server(
            config.metrics_addr,
            Arc::clone(&metrics),
            stopped(stop_tx.subscribe()),
        );
    }

    if let Some(limiter) = &rate_limiter {
        spawn_rate_limit_cleanup(limiter.clone(), stopped(stop_tx.subscribe()));
    }

    let listener = TcpListener::bind(config.listen_addr).await.unwrap_or_else(|e| {
        error!(%e, addr = %config.listen_addr, "failed to bind");
        std::process::exit(1);
    });
    info!(addr = %config.listen_addr, tls = tls_acceptor.is_some(), "listening");

    let client = build_https_client();
    let state = ServerState {
        config: Arc::new(config),
        balancer,
        metrics,
        rate_limiter,
        tls_acceptor,
    };

    serve(listener, client, state, shutdown_signal()).await;

    let _ = stop_tx.send(true);
    info!("shutdown complete");
}
