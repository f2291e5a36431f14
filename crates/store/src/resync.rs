use std::sync::{Mutex, PoisonError};

use kollect_core::ResourceKind;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receiving end held by one watch loop. A signal means: drop the current
/// stream and restart from a fresh list+watch.
#[derive(Debug)]
pub struct ResyncSignal {
    kind: ResourceKind,
    rx: mpsc::Receiver<()>,
}

impl ResyncSignal {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Resolves on the next signal. Pends forever once the coordinator is gone.
    pub async fn recv(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Discard a signal that arrived while the loop was not streaming.
    pub fn clear(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// Fan-out of resync signals to every registered watch loop.
#[derive(Debug, Default)]
pub struct ResyncCoordinator {
    channels: Mutex<Vec<(ResourceKind, mpsc::Sender<()>)>>,
}

impl ResyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ResourceKind) -> ResyncSignal {
        // One slot: repeated broadcasts coalesce while a signal is pending.
        let (tx, rx) = mpsc::channel(1);
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.push((kind, tx));
        debug!(kind = %kind, registered = channels.len(), "resync: loop registered");
        ResyncSignal { kind, rx }
    }

    /// Signal every live loop without waiting on any of them. Channels whose
    /// loop is gone are pruned. Returns the number of loops signaled.
    pub fn broadcast(&self) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|(_, tx)| !tx.is_closed());
        let mut signaled = 0;
        for (kind, tx) in channels.iter() {
            match tx.try_send(()) {
                Ok(()) => signaled += 1,
                Err(mpsc::error::TrySendError::Full(())) => {
                    debug!(kind = %kind, "resync: signal already pending");
                }
                Err(mpsc::error::TrySendError::Closed(())) => {}
            }
        }
        counter!("kollect_resync_broadcasts_total", 1);
        info!(loops = channels.len(), signaled, "resync: broadcast");
        signaled
    }

    pub fn registered(&self) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|(_, tx)| !tx.is_closed());
        channels.len()
    }
}
