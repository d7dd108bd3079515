use classical_cv::DispatcherConfig;
use classical_cv_server::{start_server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Bind address and model paths from env or defaults
    let handle = start_server(ServerConfig::from_env(), DispatcherConfig::from_env()).await?;
    // Park forever
    handle.await.ok();
    Ok(())
}
