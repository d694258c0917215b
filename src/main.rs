use dotenvy::dotenv;
use oxide_fetch::bot::run_bot;
use oxide_fetch::config::Settings;
use oxide_fetch::logging;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    logging::init();

    info!("Starting Oxide Fetch bot...");

    let settings = init_settings();
    run_bot(settings).await
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}
