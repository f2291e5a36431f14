use std::sync::{Mutex, PoisonError};

use kollect_core::ChangeRecord;
use metrics::gauge;
use tokio::sync::Notify;

/// Pending change records since the last drain.
///
/// Producers append from every watch loop; the sender is the only consumer.
#[derive(Debug, Default)]
pub struct ChangeReportBuffer {
    pending: Mutex<Vec<ChangeRecord>>,
    arrived: Notify,
}

impl ChangeReportBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: ChangeRecord) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.push(record);
        gauge!("kollect_buffer_pending", pending.len() as f64);
    }

    /// Take every pending record in append order.
    pub fn drain(&self) -> Vec<ChangeRecord> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        gauge!("kollect_buffer_pending", 0.0);
        std::mem::take(&mut *pending)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the sender. A wake-up with no waiter is kept until the next wait.
    pub fn notify_data_arrival(&self) {
        self.arrived.notify_one();
    }

    pub async fn data_arrived(&self) {
        self.arrived.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kollect_core::ResourceKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn del(kind: ResourceKind, name: &str) -> ChangeRecord {
        ChangeRecord::deleted(kind, Some(name.to_string()))
    }

    #[test]
    fn drain_returns_fifo_and_empties() {
        let buf = ChangeReportBuffer::new();
        buf.append(del(ResourceKind::Pod, "a"));
        buf.append(del(ResourceKind::Node, "b"));
        buf.append(del(ResourceKind::Pod, "c"));
        assert_eq!(buf.len(), 3);
        let out = buf.drain();
        assert_eq!(out, vec![del(ResourceKind::Pod, "a"), del(ResourceKind::Node, "b"), del(ResourceKind::Pod, "c")]);
        assert!(buf.is_empty());
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn duplicates_are_kept() {
        let buf = ChangeReportBuffer::new();
        buf.append(del(ResourceKind::Pod, "a"));
        buf.append(del(ResourceKind::Pod, "a"));
        assert_eq!(buf.drain().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_lose_nothing_and_keep_per_producer_order() {
        let buf = Arc::new(ChangeReportBuffer::new());
        let mut handles = Vec::new();
        for kind in ResourceKind::ALL {
            let buf = Arc::clone(&buf);
            handles.push(tokio::spawn(async move {
                for i in 0..200 {
                    buf.append(del(kind, &i.to_string()));
                }
            }));
        }
        for h in handles {
            h.await.expect("producer");
        }
        let out = buf.drain();
        assert_eq!(out.len(), 6 * 200);
        for kind in ResourceKind::ALL {
            let seq: Vec<String> = out
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| match &r.payload {
                    kollect_core::Payload::Name(n) => n.clone(),
                    other => panic!("unexpected payload {other:?}"),
                })
                .collect();
            let expected: Vec<String> = (0..200).map(|i: i32| i.to_string()).collect();
            assert_eq!(seq, expected);
        }
    }

    #[tokio::test]
    async fn arrival_signal_is_not_lost_before_wait() {
        let buf = ChangeReportBuffer::new();
        buf.notify_data_arrival();
        tokio::time::timeout(Duration::from_millis(100), buf.data_arrived())
            .await
            .expect("stored permit wakes the waiter");
    }
}
