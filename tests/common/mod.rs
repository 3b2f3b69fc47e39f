#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use lnrpc_core::application::dispatcher::PaymentDispatcher;
use lnrpc_core::application::preflight::CapacityPreflight;
use lnrpc_core::application::resolver::PaymentIntentResolver;
use lnrpc_core::application::shutdown::ShutdownSignal;
use lnrpc_core::config::PaymentConfig;
use lnrpc_core::domain::acceptor::{AcceptanceRequest, PendingChannelId};
use lnrpc_core::domain::amount::{FeePerKb, MilliSatoshi, Satoshi};
use lnrpc_core::domain::channel::ChannelSnapshot;
use lnrpc_core::domain::payment::{
    NODE_ID_LEN, NodeId, PaymentHash, PaymentIntent, PaymentRequest, Preimage, Route,
};
use lnrpc_core::domain::ports::{RoutingEngine, RoutingEngineRef};
use lnrpc_core::error::Result;
use lnrpc_core::infrastructure::bolt11::Bolt11Decoder;
use lnrpc_core::infrastructure::in_memory::{InMemoryChannelState, SimulatedRouter};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn node(tag: u8) -> NodeId {
    let mut key = [2u8; NODE_ID_LEN];
    key[32] = tag;
    NodeId(key)
}

pub fn self_node() -> NodeId {
    node(0)
}

pub fn random_preimage() -> Preimage {
    Preimage(rand::random())
}

pub fn channel(tag: u8, local_sat: u64) -> ChannelSnapshot {
    ChannelSnapshot {
        channel_point: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
        short_channel_id: tag as u64,
        remote_node: node(tag),
        local_balance: MilliSatoshi::from_sat(local_sat),
        remote_balance: MilliSatoshi::from_sat(local_sat / 2),
        local_reserve: Satoshi(1_000),
        remote_reserve: Satoshi(1_000),
        active_htlcs: 0,
    }
}

/// A manual-mode payment of `amt` sats to `dest`.
pub fn manual_payment(dest: NodeId, amt: u64, hash: PaymentHash) -> PaymentRequest {
    PaymentRequest {
        dest_string: dest.to_string(),
        amt,
        payment_hash_string: hash.to_string(),
        ..Default::default()
    }
}

pub fn acceptance_request(tag: u8) -> AcceptanceRequest {
    AcceptanceRequest {
        node_pubkey: node(tag),
        chain_hash: [0; 32],
        pending_chan_id: PendingChannelId([tag; 32]),
        funding_amt: Satoshi(100_000),
        push_amt: MilliSatoshi::ZERO,
        dust_limit: Satoshi(573),
        max_value_in_flight: MilliSatoshi::from_sat(99_000),
        channel_reserve: Satoshi(1_000),
        min_htlc: MilliSatoshi(1),
        fee_per_kb: FeePerKb(2_500),
        csv_delay: 144,
        max_accepted_htlcs: 483,
        channel_flags: 1,
    }
}

/// A node with one well funded channel to `node(1)` and a router that
/// settles the invoices registered on it.
pub struct Harness {
    pub state: Arc<InMemoryChannelState>,
    pub router: Arc<SimulatedRouter>,
    pub shutdown: ShutdownSignal,
    pub dispatcher: PaymentDispatcher,
}

impl Harness {
    pub async fn new(max_in_flight: usize) -> Self {
        let state = Arc::new(InMemoryChannelState::new(FeePerKb(1_000)));
        state.add_channel(channel(1, 1_000_000), true, true).await;
        let router = Arc::new(SimulatedRouter::new(state.clone(), MilliSatoshi(1_000)));
        let shutdown = ShutdownSignal::new();
        let dispatcher = dispatcher(state.clone(), router.clone(), shutdown.clone(), max_in_flight);
        Self {
            state,
            router,
            shutdown,
            dispatcher,
        }
    }

    /// Registers a fresh invoice and returns its hash.
    pub async fn invoice(&self) -> PaymentHash {
        self.router.add_invoice(random_preimage()).await
    }
}

pub fn dispatcher(
    state: Arc<InMemoryChannelState>,
    router: RoutingEngineRef,
    shutdown: ShutdownSignal,
    max_in_flight: usize,
) -> PaymentDispatcher {
    let config = PaymentConfig {
        max_in_flight,
        ..Default::default()
    };
    let resolver = PaymentIntentResolver::new(
        self_node(),
        Arc::new(Bolt11Decoder::new(bitcoin::Network::Regtest)),
        config,
    );
    let preflight = CapacityPreflight::new(state, 43);
    PaymentDispatcher::new(
        Arc::new(resolver),
        Arc::new(preflight),
        router,
        shutdown,
        max_in_flight,
    )
}

/// A router that holds every payment for a while and records how many it
/// held at once.
pub struct GaugedRouter {
    inner: Arc<SimulatedRouter>,
    hold: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugedRouter {
    pub fn new(inner: Arc<SimulatedRouter>, hold: Duration) -> Self {
        Self {
            inner,
            hold,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingEngine for GaugedRouter {
    async fn send_payment(&self, intent: &PaymentIntent) -> Result<(Preimage, Route)> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        let result = self.inner.send_payment(intent).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn send_to_route(&self, payment_hash: PaymentHash, route: &Route) -> Result<Preimage> {
        self.inner.send_to_route(payment_hash, route).await
    }
}

/// Writes a payments CSV in manual mode, one row per `(dest, amt, hash)`.
pub fn write_payments_csv(path: &Path, rows: &[(NodeId, u64, PaymentHash)]) -> Result<()> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["dest", "amt", "payment_hash"])?;
    for (dest, amt, hash) in rows {
        wtr.write_record([dest.to_string(), amt.to_string(), hash.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}
