//! Relay process pairing two editors.
//!
//! ```text
//! DUET_RELAY_ADDR=0.0.0.0:8080 RUST_LOG=debug duet-relay
//! ```

use duet_sync::config::RelayConfig;
use duet_sync::relay::RelayServer;
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from_env();
    info!("Starting duet relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
    }
    Ok(())
}
