//! ID resolver module
//!
//! Resolves what the user typed into a full UUID. Configurations may be named
//! by their exact name; both configurations and runs accept an unambiguous
//! ID prefix.

use anyhow::{Context, Result, anyhow};
use kiln_client::OrchestratorClient;
use kiln_core::dto::configuration::ConfigurationQuery;
use kiln_core::dto::page::MAX_PAGE_SIZE;
use kiln_core::dto::run::RunQuery;
use uuid::Uuid;

/// Resolve a configuration name, ID or ID prefix
pub async fn resolve_configuration_id(client: &OrchestratorClient, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let mut candidates = Vec::new();
    let mut query = ConfigurationQuery {
        page: Some(1),
        page_size: Some(MAX_PAGE_SIZE),
        ..Default::default()
    };
    loop {
        let page = client
            .list_configurations(&query)
            .await
            .context("Failed to fetch configurations for ID resolution")?;
        let more = page.has_more();
        candidates.extend(page.items.into_iter().map(|c| (c.id, c.name)));
        if !more {
            break;
        }
        query.page = Some(page.page + 1);
    }

    if let Some((id, _)) = candidates.iter().find(|(_, name)| name == input) {
        return Ok(*id);
    }

    let ids: Vec<Uuid> = candidates.iter().map(|(id, _)| *id).collect();
    match_prefix(&ids, input, "configuration")
}

/// Resolve a run ID or ID prefix
///
/// Prefixes are matched against the newest runs first; `configuration_id`
/// narrows the search when known.
pub async fn resolve_run_id(
    client: &OrchestratorClient,
    input: &str,
    configuration_id: Option<Uuid>,
) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let mut ids = Vec::new();
    let mut query = RunQuery {
        configuration_id,
        page: Some(1),
        page_size: Some(MAX_PAGE_SIZE),
        ..Default::default()
    };
    loop {
        let page = client
            .list_runs(&query)
            .await
            .context("Failed to fetch runs for ID resolution")?;
        let more = page.has_more();
        ids.extend(page.items.iter().map(|r| r.id));
        if !more {
            break;
        }
        query.page = Some(page.page + 1);
    }

    match_prefix(&ids, input, "run")
}

/// Pick the single ID starting with `prefix`
fn match_prefix(ids: &[Uuid], prefix: &str, kind: &str) -> Result<Uuid> {
    let prefix = prefix.to_lowercase();
    let matches: Vec<Uuid> = ids
        .iter()
        .copied()
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No {} found matching '{}'", kind, prefix)),
        [id] => Ok(*id),
        _ => {
            let listed: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple {}s: {}",
                prefix,
                kind,
                listed.join(", ")
            ))
        }
    }
}
