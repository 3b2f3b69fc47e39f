use clap::Parser;
use lnrpc_core::application::dispatcher::PaymentDispatcher;
use lnrpc_core::application::preflight::CapacityPreflight;
use lnrpc_core::application::resolver::PaymentIntentResolver;
use lnrpc_core::application::shutdown::ShutdownSignal;
use lnrpc_core::config::RpcConfig;
use lnrpc_core::domain::payment::{NodeId, PaymentRequest, SendResponse};
use lnrpc_core::infrastructure::bolt11::Bolt11Decoder;
use lnrpc_core::infrastructure::in_memory::SimulatedNetwork;
use lnrpc_core::infrastructure::stream::{inbound, outbound};
use lnrpc_core::interfaces::csv::payment_reader::PaymentReader;
use lnrpc_core::interfaces::csv::response_writer::ResponseWriter;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Streams a file of payments through the dispatcher against a simulated
/// node and prints one CSV row per payment outcome.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON description of the simulated node: its identity, channels and
    /// the invoices it can settle
    network: PathBuf,

    /// Input payments CSV file
    payments: PathBuf,

    /// JSON config file overriding the default limits
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override of the in-flight payment ceiling
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Hex identity to resolve payments as, instead of the network file's
    #[arg(long)]
    self_node: Option<NodeId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => RpcConfig::load(path).into_diagnostic()?,
        None => RpcConfig::default(),
    };
    if let Some(max_in_flight) = cli.max_in_flight {
        config.payments.max_in_flight = max_in_flight;
        config.validate().into_diagnostic()?;
    }

    let network = SimulatedNetwork::load(&cli.network).into_diagnostic()?;
    let (state, router) = network.build().await;

    let shutdown = ShutdownSignal::new();
    let resolver = PaymentIntentResolver::new(
        cli.self_node.unwrap_or(network.self_node),
        Arc::new(Bolt11Decoder::new(config.channels.network)),
        config.payments.clone(),
    );
    let preflight = CapacityPreflight::new(state, config.payments.htlc_output_size);
    let dispatcher = PaymentDispatcher::new(
        Arc::new(resolver),
        Arc::new(preflight),
        router,
        shutdown.clone(),
        config.payments.max_in_flight,
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, no further payments will be dispatched");
                shutdown.trigger();
            }
        });
    }

    let (request_tx, requests) = inbound::<PaymentRequest>(64);
    let (responses, mut response_rx) = outbound::<SendResponse>(64);

    let file = File::open(&cli.payments).into_diagnostic()?;
    let feeder = tokio::task::spawn_blocking(move || {
        for (line, row) in PaymentReader::new(file).payments().enumerate() {
            match row {
                Ok(req) => {
                    if request_tx.blocking_send(Ok(req)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(row = line + 1, error = %e, "skipping unreadable payment row"),
            }
        }
    });

    let serve = tokio::spawn(async move { dispatcher.serve(requests, responses).await });

    let stdout = io::stdout();
    let mut writer = ResponseWriter::new(stdout.lock());
    let (mut succeeded, mut failed) = (0usize, 0usize);
    // Closes once the dispatcher and every payment it started are done.
    while let Some(response) = response_rx.recv().await {
        if response.is_success() {
            succeeded += 1;
        } else {
            failed += 1;
        }
        writer.write_response(&response).into_diagnostic()?;
    }

    feeder.await.into_diagnostic()?;
    serve.await.into_diagnostic()?.into_diagnostic()?;
    info!(succeeded, failed, "payment stream finished");
    Ok(())
}
