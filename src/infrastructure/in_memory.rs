use crate::domain::amount::{FeePerKb, MilliSatoshi, Satoshi};
use crate::domain::channel::{
    ChannelId, ChannelLifecycleEvent, ChannelSnapshot, FeePreference, LifecycleNotification,
    LinkStatus, OpenChannelParams,
};
use crate::domain::payment::{
    NodeId, PaymentHash, PaymentIntent, Preimage, Route, RouteHop,
};
use crate::domain::ports::{ChannelEngine, ChannelStateSource, LifecycleFeed, RoutingEngine};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use bitcoin::hashes::{Hash, sha256};
use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

/// Block height the simulated router builds timelocks from.
const SIMULATED_BLOCK_HEIGHT: u32 = 100;

/// Timelock delta each simulated forwarding hop adds.
const SIMULATED_HOP_CLTV_DELTA: u32 = 40;

/// A thread-safe in-memory view of channels, peers and switch links.
///
/// Channels are kept in insertion order, which is the order the capacity
/// preflight walks them in.
#[derive(Default, Clone)]
pub struct InMemoryChannelState {
    channels: Arc<RwLock<Vec<ChannelSnapshot>>>,
    online_peers: Arc<RwLock<HashSet<NodeId>>>,
    links: Arc<RwLock<HashMap<ChannelId, LinkStatus>>>,
    relay_fee: FeePerKb,
}

impl InMemoryChannelState {
    pub fn new(relay_fee: FeePerKb) -> Self {
        Self {
            relay_fee,
            ..Default::default()
        }
    }

    /// Adds or replaces a channel, registering its link in the switch.
    pub async fn add_channel(&self, channel: ChannelSnapshot, peer_online: bool, link_eligible: bool) {
        self.set_peer_online(channel.remote_node, peer_online).await;
        self.set_link(
            ChannelId::from_outpoint(&channel.channel_point),
            Some(LinkStatus {
                eligible_to_forward: link_eligible,
            }),
        )
        .await;

        let mut channels = self.channels.write().await;
        match channels
            .iter_mut()
            .find(|c| c.channel_point == channel.channel_point)
        {
            Some(existing) => *existing = channel,
            None => channels.push(channel),
        }
    }

    pub async fn remove_channel(&self, channel_point: &OutPoint) {
        self.channels
            .write()
            .await
            .retain(|c| c.channel_point != *channel_point);
        self.links
            .write()
            .await
            .remove(&ChannelId::from_outpoint(channel_point));
    }

    pub async fn set_peer_online(&self, node: NodeId, online: bool) {
        let mut peers = self.online_peers.write().await;
        if online {
            peers.insert(node);
        } else {
            peers.remove(&node);
        }
    }

    /// Sets or, with `None`, removes the switch link of a channel.
    pub async fn set_link(&self, channel_id: ChannelId, status: Option<LinkStatus>) {
        let mut links = self.links.write().await;
        match status {
            Some(status) => links.insert(channel_id, status),
            None => links.remove(&channel_id),
        };
    }
}

#[async_trait]
impl ChannelStateSource for InMemoryChannelState {
    async fn open_channels(&self) -> Result<Vec<ChannelSnapshot>> {
        Ok(self.channels.read().await.clone())
    }

    async fn is_peer_online(&self, node: &NodeId) -> bool {
        self.online_peers.read().await.contains(node)
    }

    async fn link(&self, channel_id: &ChannelId) -> Option<LinkStatus> {
        self.links.read().await.get(channel_id).copied()
    }

    async fn relay_fee(&self) -> FeePerKb {
        self.relay_fee
    }
}

/// A payment router that settles every payment whose preimage it knows.
///
/// Routes go straight to the destination when it is a direct peer, and
/// through the first channel's peer otherwise, which charges a flat fee.
pub struct SimulatedRouter {
    state: Arc<InMemoryChannelState>,
    hop_fee: MilliSatoshi,
    preimages: RwLock<HashMap<PaymentHash, Preimage>>,
    delays: RwLock<HashMap<PaymentHash, Duration>>,
    failures: RwLock<HashMap<PaymentHash, String>>,
    attempts: AtomicUsize,
}

impl SimulatedRouter {
    pub fn new(state: Arc<InMemoryChannelState>, hop_fee: MilliSatoshi) -> Self {
        Self {
            state,
            hop_fee,
            preimages: RwLock::new(HashMap::new()),
            delays: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Makes payments to `preimage`'s hash succeed. Returns that hash.
    pub async fn add_invoice(&self, preimage: Preimage) -> PaymentHash {
        let hash = preimage.payment_hash();
        self.preimages.write().await.insert(hash, preimage);
        hash
    }

    /// Holds payments to `hash` for `delay` before settling them.
    pub async fn set_delay(&self, hash: PaymentHash, delay: Duration) {
        self.delays.write().await.insert(hash, delay);
    }

    pub async fn fail_payment(&self, hash: PaymentHash, reason: impl Into<String>) {
        self.failures.write().await.insert(hash, reason.into());
    }

    /// Number of payments handed to this router so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn settle(&self, hash: PaymentHash) -> Result<Preimage> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.read().await.get(&hash).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failures.read().await.get(&hash) {
            return Err(RpcError::RoutingError(reason.clone()));
        }
        self.preimages
            .read()
            .await
            .get(&hash)
            .copied()
            .ok_or_else(|| RpcError::RoutingError("unknown payment hash".to_string()))
    }

    async fn find_route(&self, intent: &PaymentIntent) -> Result<Route> {
        let channels = self.state.open_channels().await?;
        let first = match intent.outgoing_chan_id {
            Some(id) => channels.iter().find(|c| c.short_channel_id == id),
            None => channels
                .iter()
                .find(|c| c.remote_node == intent.destination)
                .or_else(|| channels.first()),
        };
        let Some(first) = first else {
            return Err(RpcError::RoutingError(
                "unable to find a path to destination".to_string(),
            ));
        };

        let final_expiry = SIMULATED_BLOCK_HEIGHT + u32::from(intent.final_cltv_delta);
        let final_hop = |chan_id: u64| RouteHop {
            chan_id,
            pub_key: intent.destination,
            amt_to_forward: intent.amount,
            fee: MilliSatoshi::ZERO,
            expiry: final_expiry,
            custom_records: intent.dest_custom_records.clone(),
        };

        let (total_time_lock, hops) = if first.remote_node == intent.destination {
            (final_expiry, vec![final_hop(first.short_channel_id)])
        } else {
            // The channel behind the intermediate peer is not known locally.
            let mut remote_chan = [0u8; 8];
            remote_chan.copy_from_slice(&intent.destination.0[1..9]);
            let intermediate = RouteHop {
                chan_id: first.short_channel_id,
                pub_key: first.remote_node,
                amt_to_forward: intent.amount,
                fee: self.hop_fee,
                expiry: final_expiry + SIMULATED_HOP_CLTV_DELTA,
                custom_records: BTreeMap::new(),
            };
            (
                final_expiry + SIMULATED_HOP_CLTV_DELTA,
                vec![intermediate, final_hop(u64::from_be_bytes(remote_chan))],
            )
        };

        let route = Route::from_hops(total_time_lock, hops)?;
        if route.total_fees > intent.fee_limit {
            return Err(RpcError::RoutingError(format!(
                "route fee of {} exceeds fee limit of {}",
                route.total_fees, intent.fee_limit
            )));
        }
        if total_time_lock - SIMULATED_BLOCK_HEIGHT > intent.cltv_limit {
            return Err(RpcError::RoutingError(
                "route exceeds the cltv limit".to_string(),
            ));
        }
        Ok(route)
    }
}

#[async_trait]
impl RoutingEngine for SimulatedRouter {
    async fn send_payment(&self, intent: &PaymentIntent) -> Result<(Preimage, Route)> {
        let route = self.find_route(intent).await?;
        let preimage = self.settle(intent.payment_hash).await?;
        Ok((preimage, route))
    }

    async fn send_to_route(&self, payment_hash: PaymentHash, _route: &Route) -> Result<Preimage> {
        self.settle(payment_hash).await
    }
}

/// A channel engine whose opens and closes play back a script of updates.
///
/// Without a script, an open goes pending then open, and a cooperative close
/// goes closing then closed, one step every `step_delay`.
pub struct SimulatedChannelEngine {
    step_delay: Duration,
    default_fee_rate: FeePerKb,
    synced: AtomicBool,
    hold_open: AtomicBool,
    open_scripts: Mutex<VecDeque<Vec<LifecycleNotification>>>,
    opened: AtomicUsize,
    removed_links: Mutex<Vec<OutPoint>>,
    txid_counter: AtomicU64,
}

impl SimulatedChannelEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            default_fee_rate: FeePerKb::from_sat_per_byte(10),
            synced: AtomicBool::new(true),
            hold_open: AtomicBool::new(false),
            open_scripts: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
            removed_links: Mutex::new(Vec::new()),
            txid_counter: AtomicU64::new(0),
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Keeps feeds open after their script ran out, as a stalled engine would.
    pub fn hold_feeds_open(&self, hold: bool) {
        self.hold_open.store(hold, Ordering::SeqCst);
    }

    /// Replaces the default updates of the next open.
    pub async fn script_next_open(&self, script: Vec<LifecycleNotification>) {
        self.open_scripts.lock().await.push_back(script);
    }

    pub async fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub async fn removed_links(&self) -> Vec<OutPoint> {
        self.removed_links.lock().await.clone()
    }

    fn next_txid(&self) -> Txid {
        let n = self.txid_counter.fetch_add(1, Ordering::SeqCst);
        Txid::from_byte_array(sha256::Hash::hash(&n.to_be_bytes()).to_byte_array())
    }

    fn play(&self, script: Vec<LifecycleNotification>) -> LifecycleFeed {
        let (tx, rx) = mpsc::channel(script.len().max(1));
        let delay = self.step_delay;
        let hold = self.hold_open.load(Ordering::SeqCst);
        tokio::spawn(async move {
            for notification in script {
                tokio::time::sleep(delay).await;
                if tx.send(notification).await.is_err() {
                    return;
                }
            }
            if hold {
                tx.closed().await;
            }
        });
        rx
    }
}

#[async_trait]
impl ChannelEngine for SimulatedChannelEngine {
    async fn open_channel(&self, params: OpenChannelParams) -> LifecycleFeed {
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(target_node = %params.target, funding = %params.local_funding, "simulating channel open");
        let script = match self.open_scripts.lock().await.pop_front() {
            Some(script) => script,
            None => {
                let txid = self.next_txid();
                vec![
                    LifecycleNotification::Update(ChannelLifecycleEvent::Pending {
                        txid,
                        output_index: 0,
                    }),
                    LifecycleNotification::Update(ChannelLifecycleEvent::Open {
                        channel_point: OutPoint::new(txid, 0),
                    }),
                ]
            }
        };
        self.play(script)
    }

    async fn close_link(
        &self,
        channel_point: OutPoint,
        fee_rate: FeePerKb,
        _delivery_script: Option<ScriptBuf>,
    ) -> LifecycleFeed {
        debug!(%channel_point, fee_per_kb = fee_rate.0, "simulating cooperative close");
        let closing_txid = self.next_txid();
        self.play(vec![
            LifecycleNotification::Update(ChannelLifecycleEvent::Closing { closing_txid }),
            LifecycleNotification::Update(ChannelLifecycleEvent::Closed {
                closing_txid,
                success: true,
            }),
        ])
    }

    async fn force_close_contract(&self, _channel_point: OutPoint) -> Result<Txid> {
        Ok(self.next_txid())
    }

    async fn wait_for_close(&self, _channel_point: OutPoint, _closing_txid: Txid) -> Result<()> {
        tokio::time::sleep(self.step_delay).await;
        Ok(())
    }

    async fn remove_link(&self, channel_point: OutPoint) {
        self.removed_links.lock().await.push(channel_point);
    }

    async fn fee_rate(&self, preference: FeePreference) -> Result<FeePerKb> {
        if preference.sat_per_byte != 0 {
            return Ok(FeePerKb::from_sat_per_byte(preference.sat_per_byte));
        }
        if preference.target_conf != 0 {
            // Slower targets get cheaper, down to the relay floor.
            let rate = self.default_fee_rate.0 * 6 / u64::from(preference.target_conf);
            return Ok(FeePerKb(rate.max(1_000)));
        }
        Ok(self.default_fee_rate)
    }

    async fn is_synced(&self) -> Result<bool> {
        Ok(self.synced.load(Ordering::SeqCst))
    }
}

/// A simulated node: its identity, channels and the invoices it can pay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedNetwork {
    pub self_node: NodeId,
    #[serde(default = "default_relay_fee")]
    pub relay_fee_per_kb: FeePerKb,
    #[serde(default)]
    pub hop_fee_msat: MilliSatoshi,
    #[serde(default)]
    pub channels: Vec<SimulatedChannel>,
    #[serde(default)]
    pub invoices: Vec<SimulatedInvoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedChannel {
    pub funding_txid: Txid,
    #[serde(default)]
    pub output_index: u32,
    pub short_channel_id: u64,
    pub remote_node: NodeId,
    pub local_balance_sat: Satoshi,
    #[serde(default)]
    pub remote_balance_sat: Satoshi,
    #[serde(default)]
    pub reserve_sat: Satoshi,
    #[serde(default = "default_true")]
    pub peer_online: bool,
    #[serde(default = "default_true")]
    pub link_eligible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedInvoice {
    pub preimage: Preimage,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub fail_reason: Option<String>,
}

fn default_relay_fee() -> FeePerKb {
    FeePerKb(1_000)
}

fn default_true() -> bool {
    true
}

impl SimulatedNetwork {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Builds the channel state and the router this network describes.
    pub async fn build(&self) -> (Arc<InMemoryChannelState>, Arc<SimulatedRouter>) {
        let state = Arc::new(InMemoryChannelState::new(self.relay_fee_per_kb));
        for channel in &self.channels {
            let snapshot = ChannelSnapshot {
                channel_point: OutPoint::new(channel.funding_txid, channel.output_index),
                short_channel_id: channel.short_channel_id,
                remote_node: channel.remote_node,
                local_balance: channel.local_balance_sat.to_msat(),
                remote_balance: channel.remote_balance_sat.to_msat(),
                local_reserve: channel.reserve_sat,
                remote_reserve: channel.reserve_sat,
                active_htlcs: 0,
            };
            state
                .add_channel(snapshot, channel.peer_online, channel.link_eligible)
                .await;
        }

        let router = Arc::new(SimulatedRouter::new(state.clone(), self.hop_fee_msat));
        for invoice in &self.invoices {
            let hash = router.add_invoice(invoice.preimage).await;
            if invoice.delay_ms > 0 {
                router
                    .set_delay(hash, Duration::from_millis(invoice.delay_ms))
                    .await;
            }
            if let Some(reason) = &invoice.fail_reason {
                router.fail_payment(hash, reason.clone()).await;
            }
        }
        (state, router)
    }
}
