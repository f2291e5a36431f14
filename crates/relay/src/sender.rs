use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use kollect_core::ReportBatch;
use kollect_store::CollectorContext;
use metrics::{counter, histogram};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Connection, Connector};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Periodic send tick; data arrival also triggers a send.
    pub interval: Duration,
    /// Delay after a failed connect or send.
    pub reconnect_backoff: Duration,
    pub cluster_name: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(5),
            cluster_name: String::new(),
        }
    }
}

/// Owns the outbound connection and is its only writer.
///
/// The first batch after process start and after every reconnect is a
/// baseline built from the mirrors (`firstReport = true`); every other batch
/// carries the records drained since the previous send.
pub struct ConnectionSender<C: Connector> {
    ctx: Arc<CollectorContext>,
    connector: C,
    cfg: SenderConfig,
    conn: Option<Box<dyn Connection>>,
    first_report: bool,
    connected_before: bool,
}

impl<C: Connector> ConnectionSender<C> {
    pub fn new(ctx: Arc<CollectorContext>, connector: C, cfg: SenderConfig) -> Self {
        Self { ctx, connector, cfg, conn: None, first_report: true, connected_before: false }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn first_report_pending(&self) -> bool {
        self.first_report
    }

    /// Connect if needed. Every reconnect forces a resync of all watch loops
    /// and makes the next batch a baseline.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.connector.connect().await.context("connecting to collector")?;
        if self.connected_before {
            info!("reconnected to collector; forcing resync");
            self.ctx.resync.broadcast();
        } else {
            info!("connected to collector");
        }
        self.connected_before = true;
        self.first_report = true;
        self.conn = Some(conn);
        Ok(())
    }

    /// Build the next batch, or `None` when there is nothing to send.
    pub fn next_batch(&self) -> Option<ReportBatch> {
        let records = if self.first_report {
            // Pending deltas are already reflected in the mirrors.
            let skipped = self.ctx.buffer.drain().len();
            if skipped > 0 {
                debug!(skipped, "baseline supersedes pending records");
            }
            self.ctx.baseline()
        } else {
            self.ctx.buffer.drain()
        };
        if records.is_empty() {
            return None;
        }
        Some(ReportBatch {
            first_report: self.first_report,
            cluster_name: self.cfg.cluster_name.clone(),
            cluster_version: self.ctx.cluster.load().version.clone(),
            records,
        })
    }

    /// Drain and transmit one batch; returns the number of records sent.
    /// On failure the connection is dropped.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.conn.is_none() {
            bail!("not connected");
        }
        let Some(batch) = self.next_batch() else {
            return Ok(0);
        };
        let count = batch.records.len();
        let first = batch.first_report;
        let body = serde_json::to_string(&batch).context("serializing report")?;

        let started = Instant::now();
        let res = match self.conn.as_mut() {
            Some(conn) => conn.send_text(body).await,
            None => bail!("not connected"),
        };
        if let Err(e) = res {
            counter!("kollect_report_failures_total", 1);
            self.disconnect().await;
            return Err(e.context(format!("sending report of {count} records")));
        }
        histogram!("kollect_report_send_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("kollect_report_batches_total", 1);
        counter!("kollect_report_records_total", count as u64);
        info!(records = count, first_report = first, "report sent");
        self.first_report = false;
        self.ctx.readiness.mark_ready();
        Ok(count)
    }

    /// Ping an idle connection; drops it when the ping fails.
    pub async fn keepalive(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            bail!("not connected");
        };
        if let Err(e) = conn.ping().await {
            self.disconnect().await;
            return Err(e.context("keepalive"));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Send loop. Never returns.
    pub async fn run(mut self) -> Infallible {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if let Err(e) = self.ensure_connected().await {
                warn!(error = %format!("{e:#}"), backoff_ms = self.cfg.reconnect_backoff.as_millis() as u64, "collector unreachable");
                tokio::time::sleep(self.cfg.reconnect_backoff).await;
                continue;
            }
            let idle_tick = tokio::select! {
                _ = ticker.tick() => true,
                _ = self.ctx.buffer.data_arrived() => false,
            };
            let res = match self.flush().await {
                Ok(0) if idle_tick => self.keepalive().await,
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!(error = %format!("{e:#}"), backoff_ms = self.cfg.reconnect_backoff.as_millis() as u64, "report delivery failed");
                tokio::time::sleep(self.cfg.reconnect_backoff).await;
            }
        }
    }
}
