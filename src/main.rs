use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use streamchat::chat::ChatService;
use streamchat::citations::CitationRenderer;
use streamchat::remote::RemoteChain;
use streamchat::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let remote = RemoteChain::new(&config)?;
    let generation_limit = Arc::new(Semaphore::new(1));

    let chat = ChatService::new(
        &config,
        remote,
        CitationRenderer::default(),
        generation_limit,
    );

    run_server(config, chat).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
