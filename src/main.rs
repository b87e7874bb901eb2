//! Server binary: WebSocket collaboration engine plus HTTP side channels.

use easel_collab::server::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    let http_addr = config.http_addr.clone();
    let server = CollabServer::new(config);

    let manager = server.manager().clone();
    let stats = server.stats_handle();
    tokio::spawn(async move {
        if let Err(e) = easel_collab::http::serve(&http_addr, manager, stats).await {
            log::error!("http side channel failed: {e}");
        }
    });

    if let Err(e) = server.run().await {
        log::error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
