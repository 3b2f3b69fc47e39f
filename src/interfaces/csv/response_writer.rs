use crate::domain::payment::SendResponse;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct ResponseRow {
    payment_hash: String,
    status: &'static str,
    preimage: String,
    hops: usize,
    total_fees_msat: u64,
    error: String,
}

impl From<&SendResponse> for ResponseRow {
    fn from(response: &SendResponse) -> Self {
        let route = response.payment_route.as_ref();
        Self {
            payment_hash: response.payment_hash.to_string(),
            status: if response.is_success() { "succeeded" } else { "failed" },
            preimage: response
                .payment_preimage
                .map(|p| p.to_string())
                .unwrap_or_default(),
            hops: route.map_or(0, |r| r.hops.len()),
            total_fees_msat: route.map_or(0, |r| r.total_fees.msat()),
            error: response.payment_error.clone().unwrap_or_default(),
        }
    }
}

/// Writes payment responses as CSV rows, one per response, flushing after
/// each so a reader sees results as payments complete.
pub struct ResponseWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_response(&mut self, response: &SendResponse) -> Result<()> {
        self.writer.serialize(ResponseRow::from(response))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()).into())
    }
}
