use crate::domain::amount::Satoshi;
use crate::domain::payment::{FeeLimit, PaymentRequest};
use crate::error::{Result, RpcError};
use serde::Deserialize;
use std::io::Read;

/// One row of a payments file. Every column is optional so that a row only
/// names the fields of the mode it uses.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PaymentRow {
    dest: Option<String>,
    amt: Option<u64>,
    amt_msat: Option<u64>,
    payment_hash: Option<String>,
    payment_request: Option<String>,
    final_cltv_delta: Option<u32>,
    fee_limit_sat: Option<u64>,
    outgoing_chan_id: Option<u64>,
    allow_self_payment: Option<bool>,
    ignore_max_outbound_amt: Option<bool>,
}

impl From<PaymentRow> for PaymentRequest {
    fn from(row: PaymentRow) -> Self {
        PaymentRequest {
            dest_string: row.dest.unwrap_or_default(),
            amt: row.amt.unwrap_or_default(),
            amt_msat: row.amt_msat.unwrap_or_default(),
            payment_hash_string: row.payment_hash.unwrap_or_default(),
            payment_request: row.payment_request.unwrap_or_default(),
            final_cltv_delta: row.final_cltv_delta.unwrap_or_default(),
            fee_limit: row.fee_limit_sat.map(|sat| FeeLimit::Fixed(Satoshi(sat))),
            outgoing_chan_id: row.outgoing_chan_id.unwrap_or_default(),
            allow_self_payment: row.allow_self_payment.unwrap_or_default(),
            ignore_max_outbound_amt: row.ignore_max_outbound_amt.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Reads payment requests from a CSV source.
///
/// Columns: `dest, amt, amt_msat, payment_hash, payment_request,
/// final_cltv_delta, fee_limit_sat, outgoing_chan_id, allow_self_payment,
/// ignore_max_outbound_amt`. Keys and hashes are hex encoded.
pub struct PaymentReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> PaymentReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and converts rows. A row that does not parse is an
    /// error item; the rows after it are still read.
    pub fn payments(self) -> impl Iterator<Item = Result<PaymentRequest>> {
        self.reader
            .into_deserialize::<PaymentRow>()
            .map(|row| row.map(PaymentRequest::from).map_err(RpcError::from))
    }
}
