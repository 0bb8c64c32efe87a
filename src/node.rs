use crate::config::Config;
use crate::error::{GlusterError, Result};
use std::sync::Arc;
use tracing::{info, error};

/// One cluster member: the consensus core plus its HTTP front.
pub struct Node {
    config: Config,
    consensus_manager: Arc<consensus::ConsensusManager>,
    api_server: Arc<api::Server>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        info!(
            "Initializing gluster node in group {} (API port {})",
            config.cluster.group, config.api_port
        );

        let consensus_manager = Arc::new(
            consensus::ConsensusManager::new(config.clone().into()).await?
        );

        let api_server = Arc::new(
            api::Server::new(config.clone().into(), consensus_manager.clone())
        );

        Ok(Self {
            config,
            consensus_manager,
            api_server,
        })
    }

    pub fn consensus(&self) -> &Arc<consensus::ConsensusManager> {
        &self.consensus_manager
    }

    /// Runs until a component fails or the process is interrupted.
    pub async fn start(self) -> Result<()> {
        info!("Starting gluster node {}", self.consensus_manager.id());

        let mut consensus_task = {
            let consensus = self.consensus_manager.clone();
            tokio::spawn(async move {
                consensus.start().await
            })
        };

        let api_task = {
            let api = self.api_server.clone();
            tokio::spawn(async move {
                api.start().await
            })
        };

        let result = tokio::select! {
            result = &mut consensus_task => {
                error!("Consensus manager stopped: {:?}", result);
                Err(GlusterError::Task("Consensus manager stopped".to_string()))
            }
            result = api_task => {
                error!("API server stopped: {:?}", result);
                Err(GlusterError::Task("API server stopped".to_string()))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                Ok(())
            }
        };

        if !consensus_task.is_finished() {
            self.consensus_manager.shutdown();
            if let Ok(Err(e)) = consensus_task.await {
                error!("Consensus manager failed during shutdown: {}", e);
            }
        }

        info!("Gluster node on API port {} stopped", self.config.api_port);
        result
    }
}
