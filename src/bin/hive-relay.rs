//! Relay server binary.
//!
//! Honors `HOST` and `PORT`; persists room metadata to
//! `./.codehive-rooms.json` every 60 seconds and on Ctrl-C.

use codehive::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down, persisting rooms");
            server.persist_now().await;
        }
    }
}
