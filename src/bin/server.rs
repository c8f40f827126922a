//! Process entry point: loads configuration, installs structured logging,
//! and serves the voice core until shutdown.

use garson_voice_core::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    garson_voice_core::server::serve(config).await?;
    Ok(())
}
