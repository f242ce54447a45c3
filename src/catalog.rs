//! HTTP client for the metadata catalog collaborator.
//!
//! The control plane only lists and deletes branches; table metadata itself
//! is the catalog's business. Connection is lazy; nothing is called until the reaper's
//! first orphan-branch pass.

use async_trait::async_trait;
use serde::Deserialize;

use smelter_core::ports::{CatalogClient, Result};
use smelter_core::SmelterError;

pub struct HttpCatalogClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct BranchList {
    #[serde(default)]
    branches: Vec<BranchRef>,
}

#[derive(Deserialize)]
struct BranchRef {
    name: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn list_branches(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/api/v1/branches", self.base_url))
            .send()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("catalog: {e}")))?;
        if !response.status().is_success() {
            return Err(SmelterError::Unavailable(format!(
                "catalog branch listing returned {}",
                response.status()
            )));
        }
        let list: BranchList = response
            .json()
            .await
            .map_err(|e| SmelterError::Internal(anyhow::anyhow!("malformed branch list: {e}")))?;
        Ok(list.branches.into_iter().map(|b| b.name).collect())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/api/v1/branches/{name}", self.base_url))
            .send()
            .await
            .map_err(|e| SmelterError::Unavailable(format!("catalog: {e}")))?;
        if !response.status().is_success() {
            return Err(SmelterError::Unavailable(format!(
                "catalog branch delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
