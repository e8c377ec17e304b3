//! Inbound message processing over the event bus

use crate::{IncomingMessage, ReplyEngine};
use keyreply_ipc::{Envelope, MessageKind, OutboundReply};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const MAX_INBOUND_CONCURRENCY: usize = 8;

/// Per-scope mutexes. A lane is dropped once no worker holds or waits on it.
#[derive(Clone, Default)]
struct ScopeLanes {
    lanes: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ScopeLanes {
    async fn lane(&self, scope_key: &str) -> Arc<Mutex<()>> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(scope_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release(&self, scope_key: &str, lane: Arc<Mutex<()>>) {
        let mut lanes = self.lanes.lock().await;
        // One reference in the map plus ours: nobody else is queued on it.
        let idle = lanes
            .get(scope_key)
            .is_some_and(|held| Arc::ptr_eq(held, &lane) && Arc::strong_count(&lane) == 2);
        if idle {
            lanes.remove(scope_key);
        }
    }

    async fn len(&self) -> usize {
        self.lanes.lock().await.len()
    }
}

pub struct ReplyRuntime {
    engine: Arc<ReplyEngine>,
    lanes: ScopeLanes,
}

impl ReplyRuntime {
    pub fn new(engine: Arc<ReplyEngine>) -> Self {
        Self {
            engine,
            lanes: ScopeLanes::default(),
        }
    }

    pub fn engine(&self) -> &Arc<ReplyEngine> {
        &self.engine
    }

    /// Scopes with a worker currently running or queued.
    pub async fn active_scopes(&self) -> usize {
        self.lanes.len().await
    }

    /// Consumes envelopes until every inbound sender is dropped, then waits for
    /// in-flight replies. Messages sharing a scope are handled one at a time.
    /// At most [`MAX_INBOUND_CONCURRENCY`] workers exist; further envelopes wait
    /// on the bus.
    pub async fn run(
        &self,
        mut inbound: broadcast::Receiver<Envelope>,
        outbound: broadcast::Sender<OutboundReply>,
    ) {
        let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));
        let mut workers = JoinSet::new();

        loop {
            match inbound.recv().await {
                Ok(envelope) => {
                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(err) => {
                            error!(
                                "Inbound worker semaphore closed (trace_id={}): {}",
                                envelope.trace_id, err
                            );
                            break;
                        }
                    };

                    let engine = Arc::clone(&self.engine);
                    let outbound = outbound.clone();
                    let lanes = self.lanes.clone();
                    let scope_key = envelope.scope_key();

                    workers.spawn(async move {
                        let _permit = permit;
                        let lane = lanes.lane(&scope_key).await;
                        {
                            let _scope_guard = lane.lock().await;
                            handle_envelope(&engine, envelope, &outbound).await;
                        }
                        lanes.release(&scope_key, lane).await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping reply processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                }
            }

            // Reap finished workers so the set does not grow with uptime.
            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    error!("Reply worker failed: {}", e);
                }
            }
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Reply worker failed: {}", e);
            }
        }
    }
}

async fn handle_envelope(
    engine: &ReplyEngine,
    envelope: Envelope,
    outbound: &broadcast::Sender<OutboundReply>,
) {
    let trace_id = envelope.trace_id;
    let MessageKind::Message {
        scope_id,
        sender_id,
        text,
    } = envelope.kind;

    let message = IncomingMessage {
        scope_id,
        sender_id,
        text,
    };

    let Some(chain) = engine.respond(&message).await else {
        debug!("No reply (trace_id={})", trace_id);
        return;
    };

    debug!(
        "Replying with {} segment(s) (trace_id={})",
        chain.len(),
        trace_id
    );
    let reply = OutboundReply {
        trace_id,
        scope_id: message.scope_id,
        chain,
    };
    if let Err(e) = outbound.send(reply) {
        warn!("Dropped reply, no outbound listener: {}", e.0.trace_id);
    }
}
