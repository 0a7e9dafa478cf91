//! Best-effort side effects after a committed import.
//!
//! Once the bookkeeping commit has succeeded the import is durable;
//! nothing in here is allowed to influence the run's verdict. Each hook
//! runs independently and failures are logged with operator guidance.

use crate::bookkeeping::Bookkeeping;
use crate::config::{DsnFileConfig, ImporterConfig, PgConfig, ReadLayerConfig};
use crate::error::{ImportError, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub enum PostCommitHook {
    /// Write a connection-string file pointing at the new schema for a
    /// downstream process to pick up.
    DsnFile(DsnFileConfig),
    /// Add the new schema to the read layer's exposed-schema settings.
    ReadLayerSettings(ReadLayerConfig),
    /// Grant the read layer's roles access to the new schema.
    ReadLayerGrants(ReadLayerConfig),
}

impl PostCommitHook {
    pub fn name(&self) -> &'static str {
        match self {
            PostCommitHook::DsnFile(_) => "dsn file",
            PostCommitHook::ReadLayerSettings(_) => "read layer settings",
            PostCommitHook::ReadLayerGrants(_) => "read layer grants",
        }
    }

    async fn run<S: Bookkeeping>(
        &self,
        pg: &PgConfig,
        store: &mut S,
        schema_name: &str,
    ) -> Result<()> {
        match self {
            PostCommitHook::DsnFile(cfg) => write_dsn_file(cfg, pg, schema_name).await,
            PostCommitHook::ReadLayerSettings(cfg) => {
                update_read_layer_settings(cfg, schema_name).await
            }
            PostCommitHook::ReadLayerGrants(cfg) => {
                store.grant_read_access(schema_name, &cfg.roles).await
            }
        }
    }
}

/// The hook list configured for this run.
pub fn hooks_for(config: &ImporterConfig) -> Vec<PostCommitHook> {
    let mut hooks = Vec::new();
    if let Some(dsn) = &config.dsn_file {
        hooks.push(PostCommitHook::DsnFile(dsn.clone()));
    }
    if let Some(read_layer) = &config.read_layer {
        hooks.push(PostCommitHook::ReadLayerSettings(read_layer.clone()));
        hooks.push(PostCommitHook::ReadLayerGrants(read_layer.clone()));
    }
    hooks
}

/// Run every hook, swallowing and logging failures.
pub async fn run_hooks<S: Bookkeeping>(
    hooks: &[PostCommitHook],
    pg: &PgConfig,
    store: &mut S,
    schema_name: &str,
) {
    for hook in hooks {
        match hook.run(pg, &mut *store, schema_name).await {
            Ok(()) => info!("post-commit step \"{}\" done", hook.name()),
            Err(err) => {
                warn!("post-commit step \"{}\" failed: {}", hook.name(), err);
                warn!("the import is already committed; apply this step manually if needed");
            }
        }
    }
}

fn format_dsn(cfg: &DsnFileConfig, pg: &PgConfig, schema_name: &str, password: &str) -> String {
    format!(
        "dataset=host={} port={} dbname={} options=-c search_path={} user={} password={}",
        pg.host, pg.port, pg.database, schema_name, cfg.user, password
    )
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "\u{2026}".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}\u{2026}{}", head, tail)
}

async fn write_dsn_file(cfg: &DsnFileConfig, pg: &PgConfig, schema_name: &str) -> Result<()> {
    let dsn = format_dsn(cfg, pg, schema_name, &cfg.password);
    let masked = format_dsn(cfg, pg, schema_name, &mask_secret(&cfg.password));
    debug!("writing \"{}\" into {}", masked, cfg.path.display());
    tokio::fs::write(&cfg.path, dsn).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ReadLayerSettings {
    db_schema: Option<String>,
    db_extra_search_path: Option<String>,
}

/// Append `item` to a comma-separated list if it is not already present.
fn append_to_list(list: &str, item: &str) -> String {
    let mut entries: Vec<String> = list
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect();
    if !entries.iter().any(|entry| entry == item) {
        entries.push(item.to_string());
    }
    entries.join(", ")
}

/// Read-then-patch of the read layer's exposed-schema configuration.
async fn update_read_layer_settings(cfg: &ReadLayerConfig, schema_name: &str) -> Result<()> {
    let client = reqwest::Client::new();

    debug!("fetching current read layer settings from {}", cfg.api_url);
    let response = client
        .get(&cfg.api_url)
        .bearer_auth(&cfg.access_token)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ImportError::ReadLayer(format!(
            "failed to fetch settings: {} - {}",
            status, body
        )));
    }
    let settings: ReadLayerSettings = response.json().await?;

    let (Some(db_schema), Some(db_extra_search_path)) =
        (settings.db_schema, settings.db_extra_search_path)
    else {
        warn!("read layer settings are missing the schema lists, skipping update");
        return Ok(());
    };

    let updated_db_schema = append_to_list(&db_schema, schema_name);
    let updated_search_path = append_to_list(&db_extra_search_path, schema_name);
    debug!("updated db_schema: {}", updated_db_schema);
    debug!("updated db_extra_search_path: {}", updated_search_path);

    let response = client
        .patch(&cfg.api_url)
        .bearer_auth(&cfg.access_token)
        .json(&serde_json::json!({
            "db_schema": updated_db_schema,
            "db_extra_search_path": updated_search_path,
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ImportError::ReadLayer(format!(
            "failed to update settings: {} - {}",
            status, body
        )));
    }
    debug!("read layer settings updated");
    Ok(())
}
