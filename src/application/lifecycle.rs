use super::shutdown::ShutdownSignal;
use crate::config::ChannelConfig;
use crate::domain::channel::{
    ChannelId, ChannelLifecycleEvent, ChannelPoint, CloseChannelRequest, LifecycleNotification,
    OpenChannelParams, OpenChannelRequest, parse_address_script, resolve_min_confs,
};
use crate::domain::payment::NodeId;
use crate::domain::ports::{ChannelEngineRef, ChannelStateRef, LifecycleFeed, MessageSink};
use crate::error::{Result, RpcError};
use bitcoin::OutPoint;
use bitcoin::secp256k1::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Relays the progress of channel opens and closes to a client.
///
/// Each call drives the channel engine's feed until a terminal event, an
/// engine error or process shutdown, whichever comes first. Nothing is
/// retried.
pub struct ChannelLifecycleRelay {
    engine: ChannelEngineRef,
    state: ChannelStateRef,
    self_node: NodeId,
    config: ChannelConfig,
    shutdown: ShutdownSignal,
}

impl ChannelLifecycleRelay {
    pub fn new(
        engine: ChannelEngineRef,
        state: ChannelStateRef,
        self_node: NodeId,
        config: ChannelConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            engine,
            state,
            self_node,
            config,
            shutdown,
        }
    }

    /// Opens a channel and streams every update until it is confirmed open.
    pub async fn open_channel<K>(&self, req: &OpenChannelRequest, sink: &mut K) -> Result<()>
    where
        K: MessageSink<ChannelLifecycleEvent>,
    {
        trace!(
            node = %hex::encode(&req.node_pubkey),
            local = req.local_funding_amount.0,
            push = req.push_sat.0,
            "open channel requested"
        );
        if req.node_pubkey.is_empty() {
            return Err(validation("NodePubKey is not set"));
        }
        let params = self.open_params(req, &req.node_pubkey).await?;
        let target = params.target;
        let feed = self.engine.open_channel(params).await;
        self.relay(feed, sink).await.inspect_err(|e| {
            error!(node = %target, error = %e, "unable to open channel");
        })
    }

    /// Opens a channel and returns as soon as the funding transaction is
    /// broadcast. `Ok(None)` means the node shut down first.
    pub async fn open_channel_sync(&self, req: &OpenChannelRequest) -> Result<Option<ChannelPoint>> {
        if !self.engine.is_synced().await? {
            return Err(validation(
                "channels cannot be created before the wallet is fully synced",
            ));
        }
        let key_bytes = hex::decode(&req.node_pubkey_string)
            .map_err(|e| validation(format!("invalid node pubkey: {e}")))?;
        let params = self.open_params(req, &key_bytes).await?;
        let target = params.target;
        let feed = self.engine.open_channel(params).await;

        let milestone = self.first_milestone(feed).await.inspect_err(|e| {
            error!(node = %target, error = %e, "unable to open channel");
        })?;
        milestone
            .map(|event| match event {
                ChannelLifecycleEvent::Pending { txid, output_index } => {
                    Ok(ChannelPoint::from(OutPoint::new(txid, output_index)))
                }
                ChannelLifecycleEvent::Open { channel_point } => Ok(ChannelPoint::from(channel_point)),
                ChannelLifecycleEvent::Closing { .. } | ChannelLifecycleEvent::Closed { .. } => {
                    error!(node = %target, ?event, "close update on an open feed");
                    Err(RpcError::ChannelError(
                        "unexpected close update on open feed".to_string(),
                    ))
                }
            })
            .transpose()
    }

    /// Closes a channel and streams every update until the close confirms.
    pub async fn close_channel<K>(&self, req: &CloseChannelRequest, sink: &mut K) -> Result<()>
    where
        K: MessageSink<ChannelLifecycleEvent>,
    {
        let (channel_point, feed) = self.start_close(req).await?;
        self.relay(feed, sink).await.inspect_err(|e| {
            error!(%channel_point, error = %e, "unable to close channel");
        })
    }

    /// Closes a channel and returns its first milestone: the broadcast of the
    /// closing transaction, or the start of negotiation.
    pub async fn close_channel_sync(
        &self,
        req: &CloseChannelRequest,
    ) -> Result<Option<ChannelLifecycleEvent>> {
        let (channel_point, feed) = self.start_close(req).await?;
        self.first_milestone(feed).await.inspect_err(|e| {
            error!(%channel_point, error = %e, "unable to close channel");
        })
    }

    async fn open_params(&self, req: &OpenChannelRequest, key_bytes: &[u8]) -> Result<OpenChannelParams> {
        let local_funding = req.local_funding_amount;
        if req.push_sat >= local_funding {
            return Err(validation(
                "amount pushed to remote peer for initial state must be below the local funding amount",
            ));
        }
        if local_funding > self.config.max_funding_sat {
            return Err(validation(format!(
                "funding amount is too large, the max channel size is: {}",
                self.config.max_funding_sat
            )));
        }
        if local_funding < self.config.min_funding_sat {
            return Err(validation(format!(
                "channel is too small, the minimum channel size is: {}",
                self.config.min_funding_sat
            )));
        }
        let min_confs = resolve_min_confs(req.min_confs, req.spend_unconfirmed)?;

        let target = PublicKey::from_slice(key_bytes)
            .map(NodeId::from)
            .map_err(|e| validation(format!("invalid node pubkey: {e}")))?;
        if target == self.self_node {
            return Err(validation("cannot open channel to self"));
        }

        let funding_fee_rate = self.engine.fee_rate(req.fee_preference()).await?;
        debug!(fee_per_kb = funding_fee_rate.0, "using funding fee rate");

        let shutdown_script = parse_address_script(&req.close_address, self.config.network)
            .map_err(|e| validation(format!("error parsing upfront shutdown: {e}")))?;

        Ok(OpenChannelParams {
            target,
            local_funding,
            push: req.push_sat.to_msat(),
            min_htlc_in: req.min_htlc_msat,
            funding_fee_rate,
            private: req.private,
            remote_csv_delay: req.remote_csv_delay,
            min_confs,
            shutdown_script,
        })
    }

    /// Validates a close request and starts it, returning the feed to relay.
    async fn start_close(&self, req: &CloseChannelRequest) -> Result<(OutPoint, LifecycleFeed)> {
        let Some(point) = &req.channel_point else {
            return Err(validation("must specify channel point in close channel"));
        };
        if req.force && req.fee_preference().is_set() {
            return Err(validation("force closing a channel uses a pre-defined fee"));
        }
        let channel_point = point.to_outpoint()?;
        trace!(%channel_point, force = req.force, "close channel requested");

        let Some(channel) = self.state.channel(&channel_point).await? else {
            return Err(validation(format!("unable to find channel {channel_point}")));
        };

        if req.force {
            return self.start_force_close(channel_point).await.map(|feed| (channel_point, feed));
        }

        let channel_id = ChannelId::from_outpoint(&channel_point);
        if self.state.link(&channel_id).await.is_none() {
            debug!(%channel_point, "cooperative close requested for offline channel");
            return Err(RpcError::ChannelError(
                "unable to gracefully close channel while peer is offline (try force closing it instead)"
                    .to_string(),
            ));
        }

        let fee_rate = self.engine.fee_rate(req.fee_preference()).await?;
        debug!(fee_per_kb = fee_rate.0, "using closing fee rate");

        if channel.active_htlcs != 0 {
            return Err(RpcError::ChannelError(
                "cannot co-op close channel with active htlcs".to_string(),
            ));
        }

        let delivery_script = parse_address_script(&req.delivery_address, self.config.network)
            .map_err(|e| validation(format!("invalid delivery address: {e}")))?;

        let feed = self
            .engine
            .close_link(channel_point, fee_rate, delivery_script)
            .await;
        Ok((channel_point, feed))
    }

    /// Broadcasts our commitment and synthesizes the feed a cooperative
    /// close would have produced: pending now, closed once confirmed.
    async fn start_force_close(&self, channel_point: OutPoint) -> Result<LifecycleFeed> {
        self.engine.remove_link(channel_point).await;

        let closing_txid = self
            .engine
            .force_close_contract(channel_point)
            .await
            .inspect_err(|e| error!(%channel_point, error = %e, "unable to force close"))?;

        let (tx, feed) = mpsc::channel(2);
        let pending = ChannelLifecycleEvent::Pending {
            txid: closing_txid,
            output_index: 0,
        };
        tx.try_send(LifecycleNotification::Update(pending))
            .map_err(|e| RpcError::ChannelError(format!("unable to queue close update: {e}")))?;

        let engine = self.engine.clone();
        tokio::spawn(async move {
            let notification = match engine.wait_for_close(channel_point, closing_txid).await {
                Ok(()) => LifecycleNotification::Update(ChannelLifecycleEvent::Closed {
                    closing_txid,
                    success: true,
                }),
                Err(e) => LifecycleNotification::Error(e.to_string()),
            };
            if tx.send(notification).await.is_err() {
                debug!(%channel_point, "close confirmed after its call ended");
            }
        });
        Ok(feed)
    }

    async fn relay<K>(&self, mut feed: LifecycleFeed, sink: &mut K) -> Result<()>
    where
        K: MessageSink<ChannelLifecycleEvent>,
    {
        loop {
            let notification = tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    debug!("shutdown while relaying channel updates");
                    return Ok(());
                }
                notification = feed.recv() => notification,
            };
            match notification {
                Some(LifecycleNotification::Update(event)) => {
                    trace!(?event, "sending channel update");
                    let terminal = event.is_terminal();
                    sink.send(event.clone()).await?;
                    if terminal {
                        info!(?event, "channel lifecycle call completed");
                        return Ok(());
                    }
                }
                Some(LifecycleNotification::Error(msg)) => {
                    return Err(RpcError::ChannelError(msg));
                }
                None => return Err(feed_closed()),
            }
        }
    }

    async fn first_milestone(&self, mut feed: LifecycleFeed) -> Result<Option<ChannelLifecycleEvent>> {
        tokio::select! {
            biased;
            _ = self.shutdown.recv() => Ok(None),
            notification = feed.recv() => match notification {
                Some(LifecycleNotification::Update(event)) => Ok(Some(event)),
                Some(LifecycleNotification::Error(msg)) => Err(RpcError::ChannelError(msg)),
                None => Err(feed_closed()),
            },
        }
    }
}

fn validation(msg: impl Into<String>) -> RpcError {
    RpcError::ValidationError(msg.into())
}

fn feed_closed() -> RpcError {
    RpcError::ChannelError("channel engine closed the update feed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::amount::{FeePerKb, MilliSatoshi, Satoshi};
    use crate::domain::channel::{ChannelSnapshot, FundingTxid};
    use crate::domain::payment::NODE_ID_LEN;
    use crate::infrastructure::in_memory::{InMemoryChannelState, SimulatedChannelEngine};
    use crate::infrastructure::stream::outbound;
    use bitcoin::Txid;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use std::sync::Arc;
    use std::time::Duration;

    fn key(byte: u8) -> NodeId {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
        NodeId::from(PublicKey::from_secret_key(&secp, &secret))
    }

    struct Fixture {
        relay: ChannelLifecycleRelay,
        engine: Arc<SimulatedChannelEngine>,
        state: Arc<InMemoryChannelState>,
        shutdown: ShutdownSignal,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(SimulatedChannelEngine::new(Duration::from_millis(5)));
        let state = Arc::new(InMemoryChannelState::new(FeePerKb(1_000)));
        let shutdown = ShutdownSignal::new();
        let relay = ChannelLifecycleRelay::new(
            engine.clone(),
            state.clone(),
            key(1),
            ChannelConfig::default(),
            shutdown.clone(),
        );
        Fixture {
            relay,
            engine,
            state,
            shutdown,
        }
    }

    fn open_request(funding: u64, push: u64) -> OpenChannelRequest {
        OpenChannelRequest {
            node_pubkey: key(2).0.to_vec(),
            node_pubkey_string: key(2).to_string(),
            local_funding_amount: Satoshi(funding),
            push_sat: Satoshi(push),
            ..Default::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<ChannelLifecycleEvent>) -> Vec<ChannelLifecycleEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn add_channel(state: &InMemoryChannelState, tag: u8, active_htlcs: usize) -> OutPoint {
        let channel_point = OutPoint::new(Txid::from_byte_array([tag; 32]), 1);
        let mut remote = [2u8; NODE_ID_LEN];
        remote[32] = tag;
        state
            .add_channel(
                ChannelSnapshot {
                    channel_point,
                    short_channel_id: tag as u64,
                    remote_node: NodeId(remote),
                    local_balance: MilliSatoshi::from_sat(50_000),
                    remote_balance: MilliSatoshi::ZERO,
                    local_reserve: Satoshi(500),
                    remote_reserve: Satoshi(500),
                    active_htlcs,
                },
                true,
                true,
            )
            .await;
        channel_point
    }

    fn close_request(channel_point: OutPoint, force: bool) -> CloseChannelRequest {
        CloseChannelRequest {
            channel_point: Some(ChannelPoint::from(channel_point)),
            force,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_streams_until_open() {
        let f = fixture();
        let (mut sink, rx) = outbound::<ChannelLifecycleEvent>(8);
        f.relay.open_channel(&open_request(100_000, 0), &mut sink).await.unwrap();
        drop(sink);

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChannelLifecycleEvent::Pending { .. }));
        assert!(matches!(events[1], ChannelLifecycleEvent::Open { .. }));
    }

    #[tokio::test]
    async fn test_open_validation_happens_before_engine() {
        let f = fixture();
        let (mut sink, _rx) = outbound::<ChannelLifecycleEvent>(8);

        let err = f
            .relay
            .open_channel(&open_request(100_000, 100_000), &mut sink)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "amount pushed to remote peer for initial state must be below the local funding amount"
        );

        let err = f
            .relay
            .open_channel(&open_request(16_777_216, 0), &mut sink)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("funding amount is too large"));

        let err = f
            .relay
            .open_channel(&open_request(19_999, 0), &mut sink)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("channel is too small"));

        let mut to_self = open_request(100_000, 0);
        to_self.node_pubkey = key(1).0.to_vec();
        let err = f.relay.open_channel(&to_self, &mut sink).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot open channel to self");

        let mut no_key = open_request(100_000, 0);
        no_key.node_pubkey.clear();
        let err = f.relay.open_channel(&no_key, &mut sink).await.unwrap_err();
        assert_eq!(err.to_string(), "NodePubKey is not set");

        assert_eq!(f.engine.opened().await, 0);
    }

    #[tokio::test]
    async fn test_open_sync_returns_funding_point() {
        let f = fixture();
        let point = f
            .relay
            .open_channel_sync(&open_request(100_000, 1_000))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(point.funding_txid, FundingTxid::Bytes(_)));
        assert_eq!(point.output_index, 0);
    }

    #[tokio::test]
    async fn test_open_sync_requires_synced_wallet() {
        let f = fixture();
        f.engine.set_synced(false);
        let err = f
            .relay
            .open_channel_sync(&open_request(100_000, 0))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "channels cannot be created before the wallet is fully synced"
        );
    }

    #[tokio::test]
    async fn test_open_sync_refuses_close_update() {
        let f = fixture();
        f.engine
            .script_next_open(vec![LifecycleNotification::Update(
                ChannelLifecycleEvent::Closing {
                    closing_txid: Txid::from_byte_array([9; 32]),
                },
            )])
            .await;
        let err = f
            .relay
            .open_channel_sync(&open_request(100_000, 0))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RpcError::ChannelError(ref msg) if msg == "unexpected close update on open feed")
        );
    }

    #[tokio::test]
    async fn test_engine_error_ends_call() {
        let f = fixture();
        f.engine
            .script_next_open(vec![LifecycleNotification::Error("peer disconnected".into())])
            .await;
        let (mut sink, _rx) = outbound::<ChannelLifecycleEvent>(8);
        let err = f
            .relay
            .open_channel(&open_request(100_000, 0), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelError(ref msg) if msg == "peer disconnected"));
    }

    #[tokio::test]
    async fn test_force_close_pending_then_closed() {
        let f = fixture();
        let channel_point = add_channel(&f.state, 3, 2).await;
        let (mut sink, rx) = outbound::<ChannelLifecycleEvent>(8);
        f.relay
            .close_channel(&close_request(channel_point, true), &mut sink)
            .await
            .unwrap();
        drop(sink);

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        let ChannelLifecycleEvent::Pending { txid, .. } = events[0] else {
            panic!("expected pending first, got {:?}", events[0]);
        };
        assert_eq!(
            events[1],
            ChannelLifecycleEvent::Closed {
                closing_txid: txid,
                success: true
            }
        );
        assert_eq!(f.engine.removed_links().await, vec![channel_point]);
    }

    #[tokio::test]
    async fn test_force_close_rejects_fee_preference() {
        let f = fixture();
        let channel_point = add_channel(&f.state, 3, 0).await;
        let mut req = close_request(channel_point, true);
        req.sat_per_byte = 5;
        let (mut sink, _rx) = outbound::<ChannelLifecycleEvent>(8);
        let err = f.relay.close_channel(&req, &mut sink).await.unwrap_err();
        assert_eq!(err.to_string(), "force closing a channel uses a pre-defined fee");
    }

    #[tokio::test]
    async fn test_coop_close_checks() {
        let f = fixture();
        let (mut sink, _rx) = outbound::<ChannelLifecycleEvent>(8);

        let err = f
            .relay
            .close_channel(&CloseChannelRequest::default(), &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "must specify channel point in close channel");

        let busy = add_channel(&f.state, 4, 1).await;
        let err = f
            .relay
            .close_channel(&close_request(busy, false), &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot co-op close channel with active htlcs");

        let offline = add_channel(&f.state, 5, 0).await;
        f.state.set_link(ChannelId::from_outpoint(&offline), None).await;
        let err = f
            .relay
            .close_channel(&close_request(offline, false), &mut sink)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("unable to gracefully close channel"));
    }

    #[tokio::test]
    async fn test_coop_close_relays_switch_feed() {
        let f = fixture();
        let channel_point = add_channel(&f.state, 6, 0).await;
        let (mut sink, rx) = outbound::<ChannelLifecycleEvent>(8);
        f.relay
            .close_channel(&close_request(channel_point, false), &mut sink)
            .await
            .unwrap();
        drop(sink);

        let events = drain(rx).await;
        assert!(matches!(events[0], ChannelLifecycleEvent::Closing { .. }));
        assert!(matches!(
            events.last(),
            Some(ChannelLifecycleEvent::Closed { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_sync_returns_first_milestone() {
        let f = fixture();
        let channel_point = add_channel(&f.state, 7, 0).await;
        let milestone = f
            .relay
            .close_channel_sync(&close_request(channel_point, true))
            .await
            .unwrap();
        assert!(matches!(milestone, Some(ChannelLifecycleEvent::Pending { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_ends_relay_cleanly() {
        let f = fixture();
        f.engine
            .script_next_open(vec![LifecycleNotification::Update(
                ChannelLifecycleEvent::Pending {
                    txid: Txid::from_byte_array([1; 32]),
                    output_index: 0,
                },
            )])
            .await;
        f.engine.hold_feeds_open(true);

        let (mut sink, mut rx) = outbound::<ChannelLifecycleEvent>(8);
        let shutdown = f.shutdown.clone();
        let call = tokio::spawn(async move {
            f.relay.open_channel(&open_request(100_000, 0), &mut sink).await
        });

        assert!(matches!(
            rx.recv().await,
            Some(ChannelLifecycleEvent::Pending { .. })
        ));
        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
