//! Configuration-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::domain::configuration::BuildConfiguration;
use kiln_core::domain::trigger::TriggerEvent;
use kiln_core::dto::batch::{BatchDelete, BatchDeleteResult};
use kiln_core::dto::configuration::{ConfigurationQuery, CreateConfiguration, TriggerUrl};
use kiln_core::dto::page::Page;
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Configuration Management
    // =============================================================================

    /// Create a new build configuration
    ///
    /// # Returns
    /// The stored configuration with its assigned ID
    pub async fn create_configuration(&self, req: CreateConfiguration) -> Result<BuildConfiguration> {
        let url = format!("{}/configurations", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// List configurations, optionally filtered by group
    pub async fn list_configurations(
        &self,
        query: &ConfigurationQuery,
    ) -> Result<Page<BuildConfiguration>> {
        let url = format!("{}/configurations", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;

        self.handle_response(response).await
    }

    /// List the distinct configuration groups
    pub async fn list_groups(&self) -> Result<Vec<String>> {
        let url = format!("{}/configurations/groups", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get a configuration by ID
    pub async fn get_configuration(&self, id: Uuid) -> Result<BuildConfiguration> {
        let url = format!("{}/configurations/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Replace a configuration
    ///
    /// Rejected with `already-running` while a run is active, unless only
    /// descriptive fields change.
    pub async fn update_configuration(
        &self,
        id: Uuid,
        req: CreateConfiguration,
    ) -> Result<BuildConfiguration> {
        let url = format!("{}/configurations/{}", self.base_url, id);
        let response = self.client.put(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Delete a configuration together with its run history
    pub async fn delete_configuration(&self, id: Uuid) -> Result<()> {
        let url = format!("{}/configurations/{}", self.base_url, id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Delete several configurations; failures are reported per ID
    pub async fn delete_configurations(&self, ids: Vec<Uuid>) -> Result<BatchDeleteResult> {
        let url = format!("{}/configurations", self.base_url);
        let response = self
            .client
            .delete(&url)
            .json(&BatchDelete { ids })
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Trigger Tokens
    // =============================================================================

    /// Replace the webhook token; the previous URL stops working
    pub async fn reset_token(&self, id: Uuid) -> Result<TriggerUrl> {
        let url = format!("{}/configurations/{}/reset-token", self.base_url, id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the webhook trigger URL of a configuration
    pub async fn trigger_url(&self, id: Uuid) -> Result<TriggerUrl> {
        let url = format!("{}/configurations/{}/trigger-url", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Trigger audit trail of a configuration, newest first
    pub async fn list_trigger_events(
        &self,
        id: Uuid,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> Result<Page<TriggerEvent>> {
        let url = format!("{}/configurations/{}/triggers", self.base_url, id);
        let params: Vec<(&str, u32)> = [("page", page), ("page_size", page_size)]
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();
        let response = self.client.get(&url).query(&params).send().await?;

        self.handle_response(response).await
    }
}
