use crate::domain::amount::Satoshi;
use crate::domain::channel::{ChannelId, ChannelSnapshot};
use crate::domain::payment::PaymentIntent;
use crate::domain::ports::ChannelStateRef;
use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An invoice about to be created, as far as the receive check cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboundInvoice {
    pub value: Satoshi,
    pub ignore_max_inbound_amt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    /// Balance usable in this direction: the relevant side's balance minus
    /// the reserve that side must keep. May be negative.
    fn usable(&self, channel: &ChannelSnapshot) -> i64 {
        match self {
            Direction::Outbound => {
                signed(channel.local_balance.to_sat()) - signed(channel.local_reserve)
            }
            Direction::Inbound => {
                signed(channel.remote_balance.to_sat()) - signed(channel.remote_reserve)
            }
        }
    }
}

fn signed(amount: Satoshi) -> i64 {
    i64::try_from(amount.0).unwrap_or(i64::MAX)
}

/// Cheap check that at least one live channel could carry a payment.
///
/// This is a heuristic over a snapshot of channel state; passing it does not
/// mean the payment will succeed, and it never reserves anything.
pub struct CapacityPreflight {
    state: ChannelStateRef,
    htlc_output_size: u64,
}

impl CapacityPreflight {
    pub fn new(state: ChannelStateRef, htlc_output_size: u64) -> Self {
        Self {
            state,
            htlc_output_size,
        }
    }

    pub async fn can_send(&self, intent: &PaymentIntent) -> Result<()> {
        if intent.ignore_max_outbound_amt {
            return Ok(());
        }
        // One more HTLC output on our commitment, priced at the relay floor.
        let htlc_fee = self
            .state
            .relay_fee()
            .await
            .fee_for_size(self.htlc_output_size);
        let required = intent.amount.to_sat() + htlc_fee;
        self.check(required, Direction::Outbound).await
    }

    pub async fn can_receive(&self, invoice: &InboundInvoice) -> Result<()> {
        if invoice.ignore_max_inbound_amt {
            return Ok(());
        }
        self.check(invoice.value, Direction::Inbound).await
    }

    async fn check(&self, required: Satoshi, direction: Direction) -> Result<()> {
        let channels = self.state.open_channels().await?;
        if channels.is_empty() {
            return Err(RpcError::AdmissionError("no open channels".to_string()));
        }

        let required = signed(required);
        // (usable capacity, short channel id) of the best eligible channel
        let mut best: Option<(i64, u64)> = None;

        for channel in &channels {
            if !self.state.is_peer_online(&channel.remote_node).await {
                continue;
            }
            let channel_id = ChannelId::from_outpoint(&channel.channel_point);
            match self.state.link(&channel_id).await {
                Some(link) if link.eligible_to_forward => {}
                _ => continue,
            }

            let capacity = direction.usable(channel);
            if capacity >= required {
                return Ok(());
            }
            if best.is_none_or(|(best_capacity, _)| capacity > best_capacity) {
                best = Some((capacity, channel.short_channel_id));
            }
        }

        match best {
            None => Err(RpcError::AdmissionError(
                "no online channels found".to_string(),
            )),
            Some((capacity, short_channel_id)) => {
                let missing = required - capacity;
                debug!(
                    direction = direction.as_str(),
                    missing, short_channel_id, "preflight rejected payment"
                );
                Err(RpcError::AdmissionError(format!(
                    "not enough {} capacity (missing {} sats in channel {})",
                    direction.as_str(),
                    missing,
                    short_channel_id
                )))
            }
        }
    }
}
