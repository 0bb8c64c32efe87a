use tracing::info;
use tracing_subscriber::EnvFilter;

use gluster::{config, Config, GlusterError, Node};

#[tokio::main]
async fn main() -> Result<(), GlusterError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = config::command().get_matches();
    let config = Config::from_matches(&matches)?;

    info!("Starting gluster node");
    info!("Node configuration: {:?}", config);

    let node = Node::new(config).await?;
    node.start().await?;

    Ok(())
}
