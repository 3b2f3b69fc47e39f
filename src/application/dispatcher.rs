use super::preflight::CapacityPreflight;
use super::resolver::PaymentIntentResolver;
use super::shutdown::ShutdownSignal;
use crate::domain::payment::{
    DispatchOutcome, PaymentIntent, PaymentRequest, SendResponse, SendToRouteRequest,
};
use crate::domain::ports::{MessageSink, MessageSource, RoutingEngineRef};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinError;
use tracing::{debug, info, trace, warn};

/// Counting semaphore bounding the payments in flight.
///
/// A slot is held by an [`OwnedSemaphorePermit`] and is returned when the
/// permit drops, however the holding task ends.
#[derive(Debug, Clone)]
pub struct AdmissionPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Waits for a free slot. Returns `None` if shutdown wins the race.
    pub async fn admit(&self, shutdown: &ShutdownSignal) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = shutdown.recv() => None,
            permit = self.slots.clone().acquire_owned() => permit.ok(),
        }
    }
}

/// Executes a stream of payment requests with bounded concurrency.
///
/// Requests are resolved in order by a reader task. Each valid intent then
/// runs as its own task once it holds a slot of the admission pool, and its
/// outcome is written back onto the stream. Responses are not ordered.
#[derive(Clone)]
pub struct PaymentDispatcher {
    resolver: Arc<PaymentIntentResolver>,
    preflight: Arc<CapacityPreflight>,
    router: RoutingEngineRef,
    shutdown: ShutdownSignal,
    max_in_flight: usize,
    sync_pool: AdmissionPool,
}

impl PaymentDispatcher {
    pub fn new(
        resolver: Arc<PaymentIntentResolver>,
        preflight: Arc<CapacityPreflight>,
        router: RoutingEngineRef,
        shutdown: ShutdownSignal,
        max_in_flight: usize,
    ) -> Self {
        Self {
            resolver,
            preflight,
            router,
            shutdown,
            max_in_flight,
            sync_pool: AdmissionPool::new(max_in_flight),
        }
    }

    /// Serves one payment stream with a pool of its own.
    pub async fn serve<S, K>(&self, source: S, sink: K) -> Result<()>
    where
        S: MessageSource<PaymentRequest> + 'static,
        K: MessageSink<SendResponse> + 'static,
    {
        self.serve_with_pool(source, sink, AdmissionPool::new(self.max_in_flight))
            .await
    }

    /// Serves a stream of send-to-route requests. A request without a route
    /// ends the call like any other undecodable message.
    pub async fn serve_to_route<S, K>(&self, source: S, sink: K) -> Result<()>
    where
        S: MessageSource<SendToRouteRequest> + 'static,
        K: MessageSink<SendResponse> + 'static,
    {
        self.serve(ToRouteSource(source), sink).await
    }

    /// Serves one payment stream.
    ///
    /// Returns when the client ends its stream, when reading or writing fails,
    /// or on shutdown. Payments already dispatched keep running and still
    /// write their response; a failure to do so is only logged. Intents the
    /// reader validated before the stream ended are still dispatched once a
    /// slot frees up, without holding the call open.
    pub async fn serve_with_pool<S, K>(&self, source: S, sink: K, pool: AdmissionPool) -> Result<()>
    where
        S: MessageSource<PaymentRequest> + 'static,
        K: MessageSink<SendResponse> + 'static,
    {
        let sink = Arc::new(Mutex::new(sink));
        let (intent_tx, mut intent_rx) = mpsc::channel::<PaymentIntent>(1);
        let (err_tx, mut err_rx) = mpsc::channel::<RpcError>(1);

        let mut reader = tokio::spawn(read_payments(
            self.resolver.clone(),
            source,
            sink.clone(),
            intent_tx,
            self.shutdown.clone(),
        ));

        // Holds an intent taken off the reader while it waits for a slot.
        let mut pending: Option<PaymentIntent> = None;
        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break Ok(()),
                Some(err) = err_rx.recv() => break Err(err),
                finished = &mut reader => break reader_outcome(finished),
                permit = pool.admit(&self.shutdown), if pending.is_some() => {
                    let (Some(permit), Some(intent)) = (permit, pending.take()) else {
                        break Ok(());
                    };
                    self.spawn_payment(intent, permit, sink.clone(), err_tx.clone());
                }
                next = intent_rx.recv(), if pending.is_none() => match next {
                    Some(intent) => pending = Some(intent),
                    None => break reader_outcome((&mut reader).await),
                },
            }
        };

        if reader.is_finished() {
            // Everything the reader validated before it stopped still runs.
            let mut leftover: Vec<PaymentIntent> = pending.into_iter().collect();
            while let Ok(intent) = intent_rx.try_recv() {
                leftover.push(intent);
            }
            if !leftover.is_empty() {
                debug!(count = leftover.len(), "dispatching payments validated before the stream ended");
                self.spawn_deferred(leftover, pool, sink, err_tx);
            }
        } else {
            reader.abort();
        }
        result
    }

    fn spawn_deferred<K>(
        &self,
        intents: Vec<PaymentIntent>,
        pool: AdmissionPool,
        sink: Arc<Mutex<K>>,
        err_tx: mpsc::Sender<RpcError>,
    ) where
        K: MessageSink<SendResponse> + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            for intent in intents {
                let Some(permit) = pool.admit(&dispatcher.shutdown).await else {
                    return;
                };
                dispatcher.spawn_payment(intent, permit, sink.clone(), err_tx.clone());
            }
        });
    }

    fn spawn_payment<K>(
        &self,
        intent: PaymentIntent,
        permit: OwnedSemaphorePermit,
        sink: Arc<Mutex<K>>,
        err_tx: mpsc::Sender<RpcError>,
    ) where
        K: MessageSink<SendResponse> + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let payment_hash = intent.payment_hash;
            let response = dispatcher.dispatch_intent(&intent).await.into_response(payment_hash);
            if let Err(e) = sink.lock().await.send(response).await {
                warn!(%payment_hash, error = %e, "unable to write payment response");
                let _ = err_tx.try_send(e);
            }
        });
    }

    /// Runs the preflight and hands the intent to the routing engine.
    pub async fn dispatch_intent(&self, intent: &PaymentIntent) -> DispatchOutcome {
        let payment_hash = intent.payment_hash;
        if let Err(e) = self.preflight.can_send(intent).await {
            debug!(%payment_hash, error = %e, "payment rejected by preflight");
            return DispatchOutcome::Failed(e);
        }

        trace!(%payment_hash, amount = %intent.amount, "dispatching payment");
        let result = match &intent.route {
            Some(route) => self
                .router
                .send_to_route(payment_hash, route)
                .await
                .map(|preimage| (preimage, route.clone())),
            None => self.router.send_payment(intent).await,
        };

        match result {
            Ok((preimage, route)) => {
                info!(%payment_hash, fees = %route.total_fees, hops = route.hops.len(), "payment succeeded");
                DispatchOutcome::Succeeded { route, preimage }
            }
            Err(e) => {
                warn!(%payment_hash, error = %e, "failed sending payment");
                DispatchOutcome::Failed(e)
            }
        }
    }

    /// Single-shot payment. Invalid requests fail the call; preflight and
    /// routing failures come back inside the response. `Ok(None)` means the
    /// node shut down before the payment was admitted.
    pub async fn send_payment_sync(&self, req: &PaymentRequest) -> Result<Option<SendResponse>> {
        let intent = self.resolver.resolve(req)?;
        let Some(_permit) = self.sync_pool.admit(&self.shutdown).await else {
            return Ok(None);
        };
        let outcome = self.dispatch_intent(&intent).await;
        Ok(Some(outcome.into_response(intent.payment_hash)))
    }

    pub async fn send_to_route_sync(&self, req: SendToRouteRequest) -> Result<Option<SendResponse>> {
        let req = PaymentRequest::try_from(req)?;
        self.send_payment_sync(&req).await
    }
}

/// Resolves requests in arrival order. Invalid ones are answered in band;
/// valid intents go to the dispatch loop one at a time.
async fn read_payments<S, K>(
    resolver: Arc<PaymentIntentResolver>,
    mut source: S,
    sink: Arc<Mutex<K>>,
    intents: mpsc::Sender<PaymentIntent>,
    shutdown: ShutdownSignal,
) -> Result<()>
where
    S: MessageSource<PaymentRequest>,
    K: MessageSink<SendResponse>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.recv() => return Ok(()),
            next = source.recv() => next,
        };
        let Some(req) = next? else {
            debug!("payment stream ended by client");
            return Ok(());
        };

        match resolver.resolve(&req) {
            Ok(intent) => {
                if intents.send(intent).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) if e.is_per_item() => {
                debug!(error = %e, "rejecting invalid payment request");
                let response = SendResponse::error(req.declared_payment_hash(), &e);
                sink.lock().await.send(response).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn reader_outcome(finished: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    finished.unwrap_or_else(|e| Err(RpcError::StreamError(format!("payment reader failed: {e}"))))
}

/// Adapts a send-to-route stream to a payment stream.
struct ToRouteSource<S>(S);

#[async_trait]
impl<S> MessageSource<PaymentRequest> for ToRouteSource<S>
where
    S: MessageSource<SendToRouteRequest>,
{
    async fn recv(&mut self) -> Result<Option<PaymentRequest>> {
        match self.0.recv().await? {
            Some(req) => PaymentRequest::try_from(req).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_capacity() {
        let pool = AdmissionPool::new(2);
        let first = pool.try_admit();
        let second = pool.try_admit();
        assert!(first.is_some() && second.is_some());
        assert!(pool.try_admit().is_none());
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_admit().is_some());
        assert_eq!(pool.capacity(), 2);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_panics() {
        let pool = AdmissionPool::new(1);
        let permit = pool.try_admit().unwrap();
        let task = tokio::spawn(async move {
            let _permit = permit;
            panic!("payment task blew up");
        });
        assert!(task.await.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_admission_gives_up_on_shutdown() {
        let pool = AdmissionPool::new(1);
        let _held = pool.try_admit().unwrap();
        let shutdown = ShutdownSignal::new();

        let waiter = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.admit(&shutdown).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        let gave_up = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(gave_up);
    }
}
