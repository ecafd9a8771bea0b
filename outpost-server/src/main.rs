use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Error;
use outpost_coap::server::Server;
use outpost_proto::envelope::Psk;
use outpost_server::{
    resource::Resources,
    sink::PostgresSink,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let psk = Psk::load(&args.psk_path)?;
    tracing::info!(path = %args.psk_path.display(), "loaded pre-shared key");

    let sink = PostgresSink::connect(&args.database_url).await?;
    tracing::info!("database connection established");

    let server = Server::bind((args.bind.as_str(), args.port)).await?;
    tracing::info!(address = %server.local_addr()?, "outpost server listening");

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            signal_shutdown.cancel();
        }
    });

    server
        .with_shutdown(shutdown)
        .serve(Resources::new(psk, sink))
        .await?;
    tracing::info!("outpost server stopped");

    Ok(())
}

#[derive(Debug, Parser)]
struct Args {
    /// Address to bind the CoAP socket to.
    #[clap(long, env = "OUTPOST_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port to bind the CoAP socket to.
    #[clap(long, env = "OUTPOST_PORT", default_value_t = 5683)]
    port: u16,

    /// File holding the 32 byte pre-shared key.
    #[clap(long, env = "OUTPOST_PSK_PATH")]
    psk_path: PathBuf,

    /// Postgres connection string for the position database.
    #[clap(long, env = "DATABASE_URL")]
    database_url: String,
}
