//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::domain::log::LogTail;
use kiln_core::domain::run::{Artifact, Run};
use kiln_core::domain::trigger::TriggerSource;
use kiln_core::dto::batch::{BatchDelete, BatchDeleteResult};
use kiln_core::dto::page::Page;
use kiln_core::dto::run::{
    CancelResponse, HookTrigger, RollbackRequest, RunQuery, SubmitResponse, SubmitRun,
};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Run Lifecycle
    // =============================================================================

    /// Submit a manual run of a configuration
    ///
    /// # Arguments
    /// * `configuration_id` - The configuration to build
    /// * `operator` - Who asked for the run, recorded on the trigger
    /// * `branch` - Optional branch overriding the configured source
    ///
    /// # Returns
    /// The new run's ID and sequence number
    pub async fn submit_run(
        &self,
        configuration_id: Uuid,
        operator: Option<&str>,
        branch: Option<String>,
    ) -> Result<SubmitResponse> {
        let url = format!("{}/runs", self.base_url);
        let req = SubmitRun {
            configuration_id,
            operator: operator.map(str::to_string),
            source: TriggerSource::Manual,
            branch,
        };
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a run
    ///
    /// Returns once the request is accepted; the run reaches `cancelled`
    /// asynchronously.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelResponse> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the latest snapshot of a run
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Query run history
    pub async fn list_runs(&self, query: &RunQuery) -> Result<Page<Run>> {
        let url = format!("{}/runs", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;

        self.handle_response(response).await
    }

    /// Delete a finished run with its log and artifact
    pub async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Delete several finished runs; failures are reported per ID
    pub async fn delete_runs(&self, ids: Vec<Uuid>) -> Result<BatchDeleteResult> {
        let url = format!("{}/runs", self.base_url);
        let response = self
            .client
            .delete(&url)
            .json(&BatchDelete { ids })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Redeploy the artifact of a historical run
    pub async fn rollback(&self, run_id: Uuid, operator: Option<&str>) -> Result<SubmitResponse> {
        let url = format!("{}/runs/{}/rollback", self.base_url, run_id);
        let req = RollbackRequest {
            operator: operator.map(str::to_string),
        };
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Trigger a run through a configuration's webhook token
    pub async fn trigger_hook(
        &self,
        configuration_id: Uuid,
        token: &str,
        branch: Option<String>,
    ) -> Result<SubmitResponse> {
        let url = format!("{}/hook/{}", self.base_url, configuration_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&HookTrigger { branch })
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Logs
    // =============================================================================

    /// Read one batch of console output starting at `from_line` (1-based)
    ///
    /// Poll with the returned `next_line` until `complete` is set.
    pub async fn tail_log(
        &self,
        run_id: Uuid,
        from_line: u64,
        max_lines: Option<u32>,
    ) -> Result<LogTail> {
        let url = format!("{}/runs/{}/log", self.base_url, run_id);
        let mut request = self.client.get(&url).query(&[("from_line", from_line)]);
        if let Some(max) = max_lines {
            request = request.query(&[("max_lines", max)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Download the whole log as text
    pub async fn download_log(&self, run_id: Uuid) -> Result<String> {
        let url = format!("{}/runs/{}/log/download", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        let bytes = self.handle_bytes(response).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // =============================================================================
    // Artifacts
    // =============================================================================

    /// Manifest of the artifact of run `number` of a configuration
    pub async fn get_artifact_by_number(
        &self,
        configuration_id: Uuid,
        number: i64,
    ) -> Result<Artifact> {
        let url = format!(
            "{}/configurations/{}/runs/{}/artifact",
            self.base_url, configuration_id, number
        );
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Download one file of the artifact of run `number` of a configuration
    pub async fn download_artifact_file_by_number(
        &self,
        configuration_id: Uuid,
        number: i64,
        path: &str,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/configurations/{}/runs/{}/artifact/{}",
            self.base_url,
            configuration_id,
            number,
            path.trim_start_matches('/')
        );
        let response = self.client.get(&url).send().await?;

        self.handle_bytes(response).await
    }

    /// Manifest of a run's artifact
    pub async fn get_artifact(&self, run_id: Uuid) -> Result<Artifact> {
        let url = format!("{}/runs/{}/artifact", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Download one file of a run's artifact
    pub async fn download_artifact_file(&self, run_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/runs/{}/artifact/{}",
            self.base_url,
            run_id,
            path.trim_start_matches('/')
        );
        let response = self.client.get(&url).send().await?;

        self.handle_bytes(response).await
    }
}
