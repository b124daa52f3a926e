use lectern_server::{BoxError, ServerConfig, TransportServer};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting lectern-server...");

    TransportServer::open(config)?.run().await
}
