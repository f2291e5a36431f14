use std::any::Any;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kollect_core::{ChangeRecord, ClusterInfo, ObservedEvent, ResourceKind};
use kollect_store::{CollectorContext, ResyncSignal};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{EventStream, WatchSource};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Fixed delay before retrying a failed stream open.
    pub backoff: Duration,
    /// Minimum pause before relisting after a stream that ended on its own
    /// (server timeout, stream error, bad item). Resync restarts immediately.
    pub relist_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { backoff: Duration::from_secs(3), relist_delay: Duration::from_secs(1) }
    }
}

/// Why a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    Resync,
    /// Stream-level error or malformed item
    Stream(String),
    /// Server sent an ERROR event
    Server(String),
    /// Item for a different kind than the loop watches
    Unexpected(String),
    /// Server closed the watch (timeout)
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Teardown(Teardown),
}

/// List+watch state machine for one resource kind.
pub struct WatchLoop<S: WatchSource> {
    kind: ResourceKind,
    ctx: Arc<CollectorContext>,
    source: Arc<S>,
    resync: ResyncSignal,
    last_teardown: Option<DateTime<Utc>>,
    cfg: WatchConfig,
}

impl<S: WatchSource> WatchLoop<S> {
    /// Registers with the context's resync coordinator.
    pub fn new(kind: ResourceKind, ctx: Arc<CollectorContext>, source: Arc<S>, cfg: WatchConfig) -> Self {
        let resync = ctx.resync.register(kind);
        Self { kind, ctx, source, resync, last_teardown: None, cfg }
    }

    pub fn with_last_teardown(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_teardown = at;
        self
    }

    /// Connect, stream, tear down, repeat. Never returns.
    pub async fn run(mut self) -> Infallible {
        loop {
            let stream = self.connect().await;
            let reason = self.stream_events(stream).await;
            self.teardown(&reason);
            if reason != Teardown::Resync {
                tokio::time::sleep(self.cfg.relist_delay).await;
            }
        }
    }

    async fn connect(&mut self) -> EventStream {
        loop {
            if self.kind == ResourceKind::Node {
                self.refresh_cluster_version().await;
            }
            info!(kind = %self.kind, "watching starting");
            match self.source.open(self.kind).await {
                Ok(stream) => {
                    // The new session is already fresh.
                    if self.resync.clear() {
                        debug!(kind = %self.kind, "dropping resync signal received while connecting");
                    }
                    return stream;
                }
                Err(e) => {
                    warn!(kind = %self.kind, error = %format!("{e:#}"), backoff_ms = self.cfg.backoff.as_millis() as u64, "cannot open watch");
                    counter!("kollect_watch_open_failures_total", 1, "kind" => self.kind.as_str());
                    tokio::time::sleep(self.cfg.backoff).await;
                }
            }
        }
    }

    async fn refresh_cluster_version(&self) {
        let version = match self.source.server_version().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "server version unavailable");
                ClusterInfo::UNKNOWN_VERSION.to_string()
            }
        };
        info!(version = %version, "cluster version");
        self.ctx.set_cluster_version(version);
    }

    /// Consume one session until something tears it down.
    pub async fn stream_events(&mut self, mut stream: EventStream) -> Teardown {
        loop {
            let next = tokio::select! {
                _ = self.resync.recv() => return Teardown::Resync,
                item = stream.next() => item,
            };
            let step = match next {
                None => Step::Teardown(Teardown::Ended),
                Some(Err(e)) => Step::Teardown(Teardown::Stream(e.to_string())),
                Some(Ok(ev)) => self.apply(ev),
            };
            if let Step::Teardown(reason) = step {
                return reason;
            }
        }
    }

    /// Apply one stream item to the mirror and the change buffer.
    pub fn apply(&mut self, ev: ObservedEvent) -> Step {
        let kind = self.kind;
        let snap = match ev {
            ObservedEvent::Bookmark => return Step::Continue,
            ObservedEvent::Error(msg) => return Step::Teardown(Teardown::Server(msg)),
            ObservedEvent::Added(ref s) | ObservedEvent::Modified(ref s) | ObservedEvent::Deleted(ref s) => s,
        };
        if snap.kind != kind {
            return Step::Teardown(Teardown::Unexpected(format!("{} object on {} watch", snap.kind, kind)));
        }

        let record = match ev {
            ObservedEvent::Added(snap) => {
                if let (Some(created), Some(teardown)) = (snap.created_at, self.last_teardown) {
                    if created < teardown {
                        debug!(kind = %kind, name = %snap.identity(), "already exists, not reported");
                        counter!("kollect_watch_stale_added_total", 1, "kind" => kind.as_str());
                        return Step::Continue;
                    }
                }
                let record = ChangeRecord::created(&snap);
                self.ctx.with_mirror(kind, |m| m.upsert(snap));
                record
            }
            ObservedEvent::Modified(snap) => {
                let record = ChangeRecord::updated(&snap);
                let name = snap.identity().to_string();
                let (_, created) = self.ctx.with_mirror(kind, |m| m.upsert(snap));
                if created {
                    debug!(kind = %kind, name = %name, "update for unknown resource; stored");
                    ChangeRecord::updated_unmatched(kind)
                } else {
                    record
                }
            }
            ObservedEvent::Deleted(snap) => {
                let removed = self
                    .ctx
                    .with_mirror(kind, |m| m.remove(&snap.name, snap.generate_name.as_deref()));
                if removed.is_none() {
                    debug!(kind = %kind, name = %snap.identity(), "delete for unknown resource");
                }
                ChangeRecord::deleted(kind, removed)
            }
            ObservedEvent::Bookmark | ObservedEvent::Error(_) => return Step::Continue,
        };

        debug!(kind = %kind, action = %record.action, "change recorded");
        counter!("kollect_watch_events_total", 1, "kind" => kind.as_str(), "action" => action_label(&record));
        self.ctx.buffer.append(record);
        self.ctx.buffer.notify_data_arrival();
        Step::Continue
    }

    fn teardown(&mut self, reason: &Teardown) {
        self.last_teardown = Some(Utc::now());
        counter!("kollect_watch_restarts_total", 1, "kind" => self.kind.as_str());
        match reason {
            Teardown::Resync => info!(kind = %self.kind, "resync requested; restarting watch"),
            Teardown::Ended => info!(kind = %self.kind, "watch ended by server; restarting"),
            Teardown::Stream(e) => warn!(kind = %self.kind, error = %e, "watch stream error; restarting"),
            Teardown::Server(e) => warn!(kind = %self.kind, error = %e, "watch error event; restarting"),
            Teardown::Unexpected(e) => warn!(kind = %self.kind, error = %e, "unexpected watch item; restarting"),
        }
    }
}

fn action_label(record: &ChangeRecord) -> &'static str {
    match record.action {
        kollect_core::Action::Created => "created",
        kollect_core::Action::Updated => "updated",
        kollect_core::Action::Deleted => "deleted",
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a watch loop for `kind` under a supervisor. A panic inside the loop
/// is contained to its task; the loop is rebuilt after the backoff with the
/// fault time as its teardown time.
pub fn spawn_supervised<S: WatchSource>(
    kind: ResourceKind,
    ctx: Arc<CollectorContext>,
    source: Arc<S>,
    cfg: WatchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut resume_from = None;
        loop {
            let lp = WatchLoop::new(kind, Arc::clone(&ctx), Arc::clone(&source), cfg.clone())
                .with_last_teardown(resume_from);
            match tokio::spawn(lp.run()).await {
                Ok(never) => match never {},
                Err(e) if e.is_panic() => {
                    let payload = e.into_panic();
                    error!(kind = %kind, panic = %panic_message(payload.as_ref()), "watch loop crashed; restarting");
                    counter!("kollect_watch_panics_total", 1, "kind" => kind.as_str());
                }
                Err(_) => {
                    info!(kind = %kind, "watch loop cancelled");
                    return;
                }
            }
            resume_from = Some(Utc::now());
            tokio::time::sleep(cfg.backoff).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kollect_core::{Action, Payload, Snapshot};
    use serde_json::json;

    struct NoSource;

    #[async_trait::async_trait]
    impl WatchSource for NoSource {
        async fn open(&self, _kind: ResourceKind) -> anyhow::Result<EventStream> {
            Err(anyhow::anyhow!("offline"))
        }
    }

    fn snap(kind: ResourceKind, name: &str, ts: Option<&str>) -> Snapshot {
        let mut meta = json!({ "name": name });
        if let Some(ts) = ts {
            meta["creationTimestamp"] = json!(ts);
        }
        Snapshot::from_raw(kind, json!({ "metadata": meta })).expect("snapshot")
    }

    fn node_loop() -> (Arc<CollectorContext>, WatchLoop<NoSource>) {
        let ctx = CollectorContext::shared();
        let lp = WatchLoop::new(ResourceKind::Node, Arc::clone(&ctx), Arc::new(NoSource), WatchConfig::default());
        (ctx, lp)
    }

    #[test]
    fn added_then_deleted_records_in_order() {
        let (ctx, mut lp) = node_loop();
        let n1 = snap(ResourceKind::Node, "n1", Some("2024-01-01T00:00:00Z"));
        assert_eq!(lp.apply(ObservedEvent::Added(n1.clone())), Step::Continue);
        assert_eq!(ctx.with_mirror(ResourceKind::Node, |m| m.get("n1").cloned()), Some(n1.clone()));

        assert_eq!(lp.apply(ObservedEvent::Deleted(n1)), Step::Continue);
        assert!(ctx.with_mirror(ResourceKind::Node, |m| m.get("n1").is_none()));

        let out = ctx.buffer.drain();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].action, Action::Created);
        assert_eq!(out[0].payload, Payload::Object(json!({"name": "n1"})));
        assert_eq!(out[1].action, Action::Deleted);
        assert_eq!(out[1].payload, Payload::Name("n1".into()));
    }

    #[test]
    fn stale_added_after_teardown_is_dropped() {
        let (ctx, lp) = node_loop();
        let teardown = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z").expect("ts").with_timezone(&Utc);
        let mut lp = lp.with_last_teardown(Some(teardown));

        lp.apply(ObservedEvent::Added(snap(ResourceKind::Node, "n2", Some("2024-06-01T11:59:59Z"))));
        assert!(ctx.buffer.is_empty());
        assert!(ctx.with_mirror(ResourceKind::Node, |m| m.is_empty()));

        lp.apply(ObservedEvent::Added(snap(ResourceKind::Node, "n3", Some("2024-06-01T12:00:01Z"))));
        lp.apply(ObservedEvent::Added(snap(ResourceKind::Node, "n4", None)));
        assert_eq!(ctx.buffer.len(), 2);
        assert_eq!(ctx.with_mirror(ResourceKind::Node, |m| m.names()), vec!["n3".to_string(), "n4".to_string()]);
    }

    #[test]
    fn bookmark_is_ignored_and_error_tears_down() {
        let (ctx, mut lp) = node_loop();
        assert_eq!(lp.apply(ObservedEvent::Bookmark), Step::Continue);
        assert_eq!(
            lp.apply(ObservedEvent::Error("gone".into())),
            Step::Teardown(Teardown::Server("gone".into()))
        );
        assert!(ctx.buffer.is_empty());
    }

    #[test]
    fn modified_unknown_is_stored_but_reported_empty() {
        let (ctx, mut lp) = node_loop();
        lp.apply(ObservedEvent::Modified(snap(ResourceKind::Node, "late", None)));
        let out = ctx.buffer.drain();
        assert_eq!(out, vec![ChangeRecord::updated_unmatched(ResourceKind::Node)]);
        assert_eq!(out[0].payload, Payload::Empty);
        assert!(ctx.with_mirror(ResourceKind::Node, |m| m.get("late").is_some()));

        // Once known, later updates carry the post-update payload.
        lp.apply(ObservedEvent::Modified(snap(ResourceKind::Node, "late", None)));
        let out = ctx.buffer.drain();
        assert_eq!(out[0].action, Action::Updated);
        assert_eq!(out[0].payload, Payload::Object(json!({"name": "late"})));
        assert_eq!(ctx.with_mirror(ResourceKind::Node, |m| m.len()), 1);
    }

    #[test]
    fn deleted_unknown_reports_empty_payload() {
        let (ctx, mut lp) = node_loop();
        lp.apply(ObservedEvent::Deleted(snap(ResourceKind::Node, "ghost", None)));
        let out = ctx.buffer.drain();
        assert_eq!(out, vec![ChangeRecord::deleted(ResourceKind::Node, None)]);
    }

    #[test]
    fn foreign_kind_tears_down_without_mutation() {
        let (ctx, mut lp) = node_loop();
        let step = lp.apply(ObservedEvent::Added(snap(ResourceKind::Pod, "p1", None)));
        assert!(matches!(step, Step::Teardown(Teardown::Unexpected(_))));
        assert!(ctx.buffer.is_empty());
        assert_eq!(ctx.live_count(), 0);
    }

    #[tokio::test]
    async fn applied_event_wakes_the_sender() {
        let (ctx, mut lp) = node_loop();
        lp.apply(ObservedEvent::Added(snap(ResourceKind::Node, "n1", None)));
        tokio::time::timeout(Duration::from_millis(100), ctx.buffer.data_arrived())
            .await
            .expect("data arrival signaled");
    }

    #[test]
    fn panic_payloads_render() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
