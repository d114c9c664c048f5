use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wsreactor::{ConnectionManager, Settings};

fn main() -> wsreactor::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wsreactor=info")))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    let mut manager = ConnectionManager::bind(&config)?;
    info!("WebSocket server ready at ws://{}:{}", config.server.host, config.server.port);

    manager.on_message(|id, frame| match frame.text() {
        Some(text) => info!(connection = %id, "Message From Client: {}", text),
        None => info!(connection = %id, bytes = frame.payload.len(), "Binary message from client"),
    });

    manager.run()
}
