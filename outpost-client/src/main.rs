mod config;
mod nmea;
mod pipeline;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Error;
use outpost_coap::client::Client;
use outpost_proto::envelope::Psk;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    pipeline::{
        Collector,
        Flusher,
        Shipper,
    },
};

/// Fixes waiting between the collector and the flusher.
const FIX_QUEUE_SIZE: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let psk = Psk::load(&config.psk_path)?;
    tracing::info!(path = %config.psk_path.display(), "loaded pre-shared key");

    let serial = tokio_serial::new(config.device.to_string_lossy(), config.baud)
        .open_native_async()?;
    tracing::info!(
        device = %config.device.display(),
        baud = config.baud,
        "opened serial device"
    );

    let client = Client::connect(config.outpost_host.as_str()).await?;

    let shutdown = CancellationToken::new();
    let (fix_sender, fix_receiver) = mpsc::channel(FIX_QUEUE_SIZE);
    // capacity one: a full channel means a send is in flight
    let (batch_sender, batch_receiver) = mpsc::channel(1);

    let collector = Collector::new(config.similarity_threshold);
    let flusher = Flusher::new(config.flush_interval);
    let shipper = Shipper::new(client, psk);

    let mut collector_task = tokio::spawn(collector.run(
        nmea::Reader::new(serial),
        fix_sender,
        shutdown.clone(),
    ));
    let flusher_task = tokio::spawn(flusher.run(fix_receiver, batch_sender, shutdown.clone()));
    let shipper_task = tokio::spawn(shipper.run(batch_receiver, shutdown.clone()));

    tracing::info!(server = %config.outpost_host, "outpost client running");

    let collector_finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("received shutdown signal");
            false
        }
        _ = &mut collector_task => {
            tracing::warn!("sentence source ended, shutting down");
            true
        }
    };

    shutdown.cancel();
    if !collector_finished {
        let _ = collector_task.await;
    }
    let _ = tokio::join!(flusher_task, shipper_task);

    Ok(())
}

#[derive(Debug, Parser)]
struct Args {
    /// Path to the client configuration file.
    #[clap(short, long, env = "OUTPOST_CONFIG")]
    config: PathBuf,
}
