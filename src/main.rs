use std::sync::Arc;

use clap::Parser;
use rheovoice::{
    config::{Configuration, DEFAULT_CONFIG_PATH},
    engine::Engine,
    rpc,
};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "rheovoice")]
#[command(about = "Audio-only WebRTC SFU", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RHEOVOICE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let config = Configuration::load(&args.config).map_err(std::io::Error::other)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.engine.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = Engine::new(&config).map_err(std::io::Error::other)?;
    tracing::info!("rheovoice {} started", env!("CARGO_PKG_VERSION"));
    rpc::serve(Arc::new(engine), config.rpc.port).await
}
