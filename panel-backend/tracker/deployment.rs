use std::sync::Arc;

use tokio::sync::Mutex;

use crate::orchestrator::{OrchestratorClient, OrchestratorError};

/// Resolves the configured deployment name to its id once and remembers it.
///
/// Only a successful lookup is cached; errors and "not found" are retried on
/// the next call so a deployment registered later is still picked up.
pub struct DeploymentResolver {
    client: Arc<dyn OrchestratorClient>,
    name: String,
    cached: Mutex<Option<String>>,
}

impl DeploymentResolver {
    pub fn new(client: Arc<dyn OrchestratorClient>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn resolve(&self) -> Result<Option<String>, OrchestratorError> {
        let mut cached = self.cached.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(Some(id.clone()));
        }

        let resolved = self.client.resolve_deployment(&self.name).await?;
        match &resolved {
            Some(id) => {
                tracing::info!(deployment = %self.name, deployment_id = %id, "resolved deployment");
                *cached = Some(id.clone());
            }
            None => tracing::warn!(deployment = %self.name, "deployment not found"),
        }
        Ok(resolved)
    }
}
