use log::info;

use drawroom_session::{ServerConfig, SessionError, SessionServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting drawroom session server...");

    if let Err(e) = run().await {
        log::error!("Session server stopped: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SessionError> {
    let config = ServerConfig::from_env()?;
    match &config.storage_path {
        Some(path) => info!("Persisting rooms and snapshots under {}", path.display()),
        None => info!("No DRAWROOM_STORAGE set, keeping everything in memory"),
    }

    let server = SessionServer::new(config)?;
    server.run().await
}
