use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kollect_core::ResourceKind;
use kollect_kubehub::{spawn_supervised, KubeSource, WatchConfig};
use kollect_relay::{ConnectionSender, SenderConfig, WsConnector};
use kollect_store::CollectorContext;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kollectd", version, about = "Mirror cluster state and relay changes to a collector")]
struct Cli {
    /// Collector WebSocket URL (ws:// or wss://)
    #[arg(long = "collector-url", env = "KOLLECT_URL")]
    collector_url: String,

    /// Cluster name reported with every batch
    #[arg(long = "cluster-name", env = "CLUSTER_NAME", default_value = "")]
    cluster_name: String,

    /// Restrict namespaced kinds to one namespace (default: all)
    #[arg(long = "namespace", env = "KOLLECT_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long = "send-interval-ms", env = "KOLLECT_SEND_INTERVAL_MS", default_value_t = 1000)]
    send_interval_ms: u64,

    /// Delay before retrying a failed watch open
    #[arg(long = "watch-backoff-secs", env = "KOLLECT_WATCH_BACKOFF_SECS", default_value_t = 3)]
    watch_backoff_secs: u64,

    /// Minimum pause before relisting after a watch ends on its own
    #[arg(long = "relist-delay-ms", env = "KOLLECT_RELIST_DELAY_MS", default_value_t = 1000)]
    relist_delay_ms: u64,

    /// Delay before reconnecting to the collector
    #[arg(long = "reconnect-backoff-secs", env = "KOLLECT_RECONNECT_BACKOFF_SECS", default_value_t = 5)]
    reconnect_backoff_secs: u64,

    /// Server-side watch timeout
    #[arg(long = "watch-timeout-secs", env = "KOLLECT_WATCH_TIMEOUT_SECS", default_value_t = 290)]
    watch_timeout_secs: u32,
}

fn init_tracing() {
    let env = std::env::var("KOLLECT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KOLLECT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KOLLECT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let release = std::env::var("RELEASE").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
    info!(version = %release, "kollectd starting");

    let connector = WsConnector::new(cli.collector_url.clone())?;
    let source = Arc::new(
        KubeSource::try_default(cli.namespace.clone(), cli.watch_timeout_secs)
            .await
            .context("initializing cluster client")?,
    );
    let ctx = CollectorContext::shared();

    let watch_cfg = WatchConfig {
        backoff: Duration::from_secs(cli.watch_backoff_secs),
        relist_delay: Duration::from_millis(cli.relist_delay_ms),
    };
    for kind in ResourceKind::ALL {
        spawn_supervised(kind, Arc::clone(&ctx), Arc::clone(&source), watch_cfg.clone());
    }
    info!(kinds = ResourceKind::ALL.len(), ns = ?cli.namespace, "watch loops started");

    let sender = ConnectionSender::new(
        Arc::clone(&ctx),
        connector,
        SenderConfig {
            interval: Duration::from_millis(cli.send_interval_ms),
            reconnect_backoff: Duration::from_secs(cli.reconnect_backoff_secs),
            cluster_name: cli.cluster_name,
        },
    );
    info!(url = %cli.collector_url, "sender starting");
    let mut sender_task = tokio::spawn(sender.run());

    tokio::select! {
        res = &mut sender_task => {
            if let Err(e) = res {
                error!(error = %e, "sender task stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(ready = ctx.readiness.is_ready(), "shutdown requested");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_with_defaults() {
        let cli = Cli::try_parse_from(["kollectd", "--collector-url", "ws://collector:7555"]).expect("parse");
        assert_eq!(cli.collector_url, "ws://collector:7555");
        assert_eq!(cli.watch_backoff_secs, 3);
        assert_eq!(cli.watch_timeout_secs, 290);
        assert_eq!(cli.relist_delay_ms, 1000);
        assert_eq!(cli.namespace, None);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "kollectd",
            "--collector-url",
            "wss://c/k8s",
            "--namespace",
            "prod",
            "--send-interval-ms",
            "250",
        ])
        .expect("parse");
        assert_eq!(cli.namespace.as_deref(), Some("prod"));
        assert_eq!(cli.send_interval_ms, 250);
    }
}
