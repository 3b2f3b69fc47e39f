use super::acceptor::AcceptanceRequest;
use super::amount::FeePerKb;
use super::channel::{
    ChannelId, ChannelSnapshot, FeePreference, LifecycleNotification, LinkStatus,
    OpenChannelParams,
};
use super::payment::{DecodedInvoice, NodeId, PaymentHash, PaymentIntent, Preimage, Route};
use crate::error::Result;
use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The node's payment router. Source of truth on whether a payment succeeds.
#[async_trait]
pub trait RoutingEngine: Send + Sync {
    /// Finds a path and pays it, returning the preimage and the route used.
    async fn send_payment(&self, intent: &PaymentIntent) -> Result<(Preimage, Route)>;
    async fn send_to_route(&self, payment_hash: PaymentHash, route: &Route) -> Result<Preimage>;
}

/// Asynchronous feed of progress notifications for one open or close.
pub type LifecycleFeed = mpsc::Receiver<LifecycleNotification>;

/// The node's funding manager, HTLC switch and chain arbitrator, as far as
/// channel opens and closes are concerned.
#[async_trait]
pub trait ChannelEngine: Send + Sync {
    async fn open_channel(&self, params: OpenChannelParams) -> LifecycleFeed;
    /// Starts a cooperative close negotiated by the switch.
    async fn close_link(
        &self,
        channel_point: OutPoint,
        fee_rate: FeePerKb,
        delivery_script: Option<ScriptBuf>,
    ) -> LifecycleFeed;
    /// Broadcasts our latest commitment, returning the closing txid.
    async fn force_close_contract(&self, channel_point: OutPoint) -> Result<Txid>;
    /// Resolves once the closing transaction has confirmed.
    async fn wait_for_close(&self, channel_point: OutPoint, closing_txid: Txid) -> Result<()>;
    /// Stops the switch from forwarding over the channel.
    async fn remove_link(&self, channel_point: OutPoint);
    async fn fee_rate(&self, preference: FeePreference) -> Result<FeePerKb>;
    async fn is_synced(&self) -> Result<bool>;
}

/// Read-only view of channels, peers and links.
#[async_trait]
pub trait ChannelStateSource: Send + Sync {
    async fn open_channels(&self) -> Result<Vec<ChannelSnapshot>>;
    async fn is_peer_online(&self, node: &NodeId) -> bool;
    async fn link(&self, channel_id: &ChannelId) -> Option<LinkStatus>;
    /// The minimum relay fee of the backing chain.
    async fn relay_fee(&self) -> FeePerKb;

    async fn channel(&self, channel_point: &OutPoint) -> Result<Option<ChannelSnapshot>> {
        Ok(self
            .open_channels()
            .await?
            .into_iter()
            .find(|channel| channel.channel_point == *channel_point))
    }
}

pub trait InvoiceDecoder: Send + Sync {
    fn decode(&self, invoice: &str) -> Result<DecodedInvoice>;
}

/// Something the inbound-channel engine consults before accepting a channel.
#[async_trait]
pub trait ChannelAcceptor: Send + Sync {
    async fn accept(&self, request: &AcceptanceRequest) -> bool;
}

/// The receiving half of a client stream. `Ok(None)` is a clean end of stream.
#[async_trait]
pub trait MessageSource<T: Send + 'static>: Send {
    async fn recv(&mut self) -> Result<Option<T>>;
}

/// The sending half of a client stream.
#[async_trait]
pub trait MessageSink<T: Send + 'static>: Send {
    async fn send(&mut self, item: T) -> Result<()>;
}

pub type RoutingEngineRef = Arc<dyn RoutingEngine>;
pub type ChannelEngineRef = Arc<dyn ChannelEngine>;
pub type ChannelStateRef = Arc<dyn ChannelStateSource>;
pub type InvoiceDecoderRef = Arc<dyn InvoiceDecoder>;
