use super::shutdown::ShutdownSignal;
use crate::domain::acceptor::{AcceptanceDecision, AcceptanceRequest, PendingChannelId};
use crate::domain::ports::{ChannelAcceptor, MessageSink, MessageSource};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, trace};

/// Outstanding acceptance requests, keyed by pending channel id.
///
/// Each entry is a take-once reply slot tagged with a sequence number, so a
/// waiter that gives up only removes its own entry and never one registered
/// later under the same id.
#[derive(Default)]
pub struct CorrelationTable {
    slots: Mutex<HashMap<PendingChannelId, (u64, oneshot::Sender<bool>)>>,
    next_seq: AtomicU64,
}

impl CorrelationTable {
    /// Registers a slot for `id`. A slot already waiting under the same id is
    /// dropped, which rejects its waiter.
    pub async fn register(&self, id: PendingChannelId) -> (u64, oneshot::Receiver<bool>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if self.slots.lock().await.insert(id, (seq, tx)).is_some() {
            debug!(pending_chan_id = %id, "replaced outstanding acceptance request");
        }
        (seq, rx)
    }

    /// Hands a decision to the waiter for `id`. Returns false if nobody was
    /// waiting.
    pub async fn resolve(&self, id: PendingChannelId, accept: bool) -> bool {
        match self.slots.lock().await.remove(&id) {
            // The waiter may have timed out between lookup and send.
            Some((_, tx)) => tx.send(accept).is_ok(),
            None => false,
        }
    }

    /// Removes the slot for `id` if it is still the one registered as `seq`.
    pub async fn cancel(&self, id: PendingChannelId, seq: u64) {
        let mut slots = self.slots.lock().await;
        if slots.get(&id).is_some_and(|(current, _)| *current == seq) {
            slots.remove(&id);
        }
    }

    /// Drops every slot, rejecting all waiters.
    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The acceptor one negotiation call plugs into the inbound-channel engine.
///
/// It forwards each request to the call's stream writer and waits for the
/// client's decision, rejecting when the timeout elapses, when the call ends
/// or on shutdown.
pub struct RpcAcceptor {
    table: Arc<CorrelationTable>,
    requests: mpsc::Sender<AcceptanceRequest>,
    timeout: Duration,
    call_ended: ShutdownSignal,
    shutdown: ShutdownSignal,
}

impl RpcAcceptor {
    pub fn new(
        table: Arc<CorrelationTable>,
        requests: mpsc::Sender<AcceptanceRequest>,
        timeout: Duration,
        call_ended: ShutdownSignal,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            table,
            requests,
            timeout,
            call_ended,
            shutdown,
        }
    }

    pub async fn decide(&self, request: &AcceptanceRequest) -> bool {
        let id = request.pending_chan_id;
        let (seq, reply) = self.table.register(id).await;

        let exchange = async {
            if self.requests.send(request.clone()).await.is_err() {
                return false;
            }
            reply.await.unwrap_or(false)
        };

        // One deadline covers both handing the request over and the reply.
        let accept = tokio::select! {
            accept = exchange => accept,
            _ = tokio::time::sleep(self.timeout) => {
                error!(
                    pending_chan_id = %id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "channel acceptor returned false, reached timeout"
                );
                false
            }
            _ = self.call_ended.recv() => false,
            _ = self.shutdown.recv() => false,
        };

        self.table.cancel(id, seq).await;
        trace!(pending_chan_id = %id, accept, "acceptance decided");
        accept
    }
}

#[async_trait]
impl ChannelAcceptor for RpcAcceptor {
    async fn accept(&self, request: &AcceptanceRequest) -> bool {
        self.decide(request).await
    }
}

/// Registry of acceptors the inbound-channel engine consults. A proposal is
/// accepted only if every registered acceptor accepts it.
#[derive(Default)]
pub struct ChainedAcceptor {
    acceptors: RwLock<BTreeMap<u64, Arc<dyn ChannelAcceptor>>>,
    next_id: AtomicU64,
}

impl ChainedAcceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, acceptor: Arc<dyn ChannelAcceptor>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.acceptors.write().await.insert(id, acceptor);
        id
    }

    pub async fn remove(&self, id: u64) {
        self.acceptors.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.acceptors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ChannelAcceptor for ChainedAcceptor {
    async fn accept(&self, request: &AcceptanceRequest) -> bool {
        let acceptors: Vec<_> = self.acceptors.read().await.values().cloned().collect();
        for acceptor in acceptors {
            if !acceptor.accept(request).await {
                return false;
            }
        }
        true
    }
}

/// Serves the bidirectional acceptor call: proposals go out on the sink,
/// decisions come back on the source.
pub struct AcceptanceNegotiator {
    chained: Arc<ChainedAcceptor>,
    timeout: Duration,
    shutdown: ShutdownSignal,
}

impl AcceptanceNegotiator {
    pub fn new(chained: Arc<ChainedAcceptor>, timeout: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            chained,
            timeout,
            shutdown,
        }
    }

    /// Runs one negotiation call until the client ends its stream, a stream
    /// fails, or the node shuts down. Every waiting decision is rejected on
    /// the way out.
    pub async fn run<S, K>(&self, source: S, mut sink: K) -> Result<()>
    where
        S: MessageSource<AcceptanceDecision> + 'static,
        K: MessageSink<AcceptanceRequest>,
    {
        let table = Arc::new(CorrelationTable::default());
        let call_ended = ShutdownSignal::new();
        let (request_tx, mut request_rx) = mpsc::channel(1);

        let acceptor = RpcAcceptor::new(
            table.clone(),
            request_tx,
            self.timeout,
            call_ended.clone(),
            self.shutdown.clone(),
        );
        let acceptor_id = self.chained.add(Arc::new(acceptor)).await;

        let mut reader = tokio::spawn(read_decisions(source, table.clone(), call_ended.clone()));

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break Ok(()),
                read = &mut reader => {
                    break read.unwrap_or_else(|e| {
                        Err(RpcError::StreamError(format!("acceptor reader failed: {e}")))
                    });
                }
                Some(request) = request_rx.recv() => {
                    trace!(pending_chan_id = %request.pending_chan_id, "forwarding channel proposal");
                    if let Err(e) = sink.send(request).await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "channel acceptor stream failed, shutting down");
        }
        self.chained.remove(acceptor_id).await;
        call_ended.trigger();
        reader.abort();
        table.clear().await;
        result
    }
}

async fn read_decisions<S>(
    mut source: S,
    table: Arc<CorrelationTable>,
    call_ended: ShutdownSignal,
) -> Result<()>
where
    S: MessageSource<AcceptanceDecision>,
{
    loop {
        let decision = tokio::select! {
            _ = call_ended.recv() => return Ok(()),
            decision = source.recv() => decision?,
        };
        let Some(decision) = decision else {
            debug!("channel acceptor stream ended by client");
            return Ok(());
        };
        if !table.resolve(decision.pending_chan_id, decision.accept).await {
            debug!(
                pending_chan_id = %decision.pending_chan_id,
                "ignoring decision for unknown pending channel"
            );
        }
    }
}
