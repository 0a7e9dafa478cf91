//! The import coordinator: atomic, idempotent replacement of the current
//! dataset.
//!
//! One run walks download -> lock -> digest check -> transform -> commit
//! -> sweep. The database-level lock is acquired before the digest check
//! and held until the sweep has read back the post-commit inventory, so
//! two runs can never interleave their commit and sweep decisions. A run
//! that dies mid-way leaves at worst an orphaned schema, which a later
//! run sweeps up.

use crate::bookkeeping::{Bookkeeping, ImportInventory, ImportRecord, IMPORTS_TABLE};
use crate::config::ImporterConfig;
use crate::digest;
use crate::error::{ImportError, Result};
use crate::post_commit;
use crate::schema::format_schema_name;
use crate::subprocess::{self, RunOptions};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Summary of one coordinator run.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub download_duration_ms: u64,
    pub import_duration_ms: Option<u64>,
    pub import_skipped: bool,
    pub new_import: Option<ImportRecord>,
    pub deleted_schemas: Vec<String>,
    pub retained_schemas: Option<Vec<String>>,
}

/// Builds the run summary stage by stage instead of mutating a shared
/// result object across branches.
struct OutcomeBuilder {
    download_duration: Duration,
    import: Option<(ImportRecord, Duration)>,
    deleted_schemas: Vec<String>,
    retained_schemas: Option<Vec<String>>,
}

impl OutcomeBuilder {
    fn after_download(download_duration: Duration) -> Self {
        Self {
            download_duration,
            import: None,
            deleted_schemas: Vec::new(),
            retained_schemas: None,
        }
    }

    fn imported(self, record: ImportRecord, duration: Duration) -> Self {
        Self {
            import: Some((record, duration)),
            ..self
        }
    }

    fn swept(self, deleted_schemas: Vec<String>, retained_schemas: Vec<String>) -> Self {
        Self {
            deleted_schemas,
            retained_schemas: Some(retained_schemas),
            ..self
        }
    }

    fn skipped(self) -> ImportOutcome {
        self.build(true)
    }

    fn finish(self) -> ImportOutcome {
        self.build(false)
    }

    fn build(self, import_skipped: bool) -> ImportOutcome {
        let (new_import, import_duration) = match self.import {
            Some((record, duration)) => (Some(record), Some(duration.as_millis() as u64)),
            None => (None, None),
        };
        ImportOutcome {
            download_duration_ms: self.download_duration.as_millis() as u64,
            import_duration_ms: import_duration,
            import_skipped,
            new_import,
            deleted_schemas: self.deleted_schemas,
            retained_schemas: self.retained_schemas,
        }
    }
}

pub struct ImportCoordinator<'a, S: Bookkeeping> {
    config: &'a ImporterConfig,
    store: &'a mut S,
}

impl<'a, S: Bookkeeping> ImportCoordinator<'a, S> {
    pub fn new(config: &'a ImporterConfig, store: &'a mut S) -> Self {
        Self { config, store }
    }

    /// Run one import to completion.
    ///
    /// On any error after lock acquisition the lock stays with the
    /// session and is released when the session ends, so a crashed run
    /// cannot block future runs forever.
    pub async fn run(mut self) -> Result<ImportOutcome> {
        self.config.validate()?;

        let archive_path = self.config.archive_path();
        info!("downloading data to \"{}\"", archive_path.display());
        let download_started = Instant::now();
        subprocess::run(
            &self.config.download_script,
            &[],
            RunOptions {
                forward_stdout: self.config.forward_download_stdout,
                envs: self.download_env(),
            },
        )
        .await?;
        let outcome = OutcomeBuilder::after_download(download_started.elapsed());

        self.store.ensure_exists().await?;

        info!("acquiring the import lock");
        if !self.store.try_acquire_import_lock().await? {
            // No blocking wait: the caller treats this as "another run is
            // in progress", not as a transient error to spin on.
            return Err(ImportError::ConcurrentImport);
        }

        let mut inventory = self.store.list_imports().await?;
        if !inventory.successful_imports.is_empty() {
            info!(
                "{} successful import(s) recorded in the bookkeeping table: {}",
                inventory.successful_imports.len(),
                inventory
                    .successful_imports
                    .iter()
                    .map(|record| record.schema_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        debug!(
            "all schemas, including old/unfinished imports: {}",
            inventory.all_schemas.join(", ")
        );
        reconcile(&mut inventory);

        let feed_digest = self.compute_feed_digest(&archive_path).await?;
        let imported_at = chrono::Utc::now().timestamp();
        let schema_name = format_schema_name(imported_at);

        if let Some(prev) = inventory.latest() {
            if prev.feed_digest == feed_digest {
                info!("feed digest has not changed, skipping import");
                self.store.release_import_lock().await?;
                return Ok(outcome.skipped());
            }
        }

        info!(
            "importing data into schema \"{}\" (the import script creates it)",
            schema_name
        );
        let record = ImportRecord {
            schema_name: schema_name.clone(),
            imported_at,
            feed_digest,
        };
        let import_started = Instant::now();
        subprocess::run(
            &self.config.import_script,
            &[],
            RunOptions {
                forward_stdout: self.config.forward_import_stdout,
                envs: self.import_env(&record),
            },
        )
        .await?;
        let import_duration = import_started.elapsed();
        debug!("import succeeded in {}s", import_duration.as_secs());

        info!(
            "marking the import into schema \"{}\" as the latest",
            schema_name
        );
        self.store.record_import(&record).await?;
        let outcome = outcome.imported(record, import_duration);

        let (deleted_schemas, retained_schemas) = self.sweep().await?;
        let outcome = outcome.swept(deleted_schemas, retained_schemas);

        let hooks = post_commit::hooks_for(self.config);
        post_commit::run_hooks(&hooks, &self.config.pg, &mut *self.store, &schema_name).await;

        self.store.release_import_lock().await?;
        debug!("done");
        Ok(outcome.finish())
    }

    fn download_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "DATASET_TMP_DIR".to_string(),
                self.config.tmp_dir.display().to_string(),
            ),
            (
                "DATASET_DOWNLOAD_URL".to_string(),
                self.config.download_url.clone(),
            ),
            (
                "DATASET_DOWNLOAD_USER_AGENT".to_string(),
                self.config.download_user_agent.clone(),
            ),
            (
                "DATASET_DOWNLOAD_VERBOSE".to_string(),
                self.config.download_script_verbose.to_string(),
            ),
        ]
    }

    fn import_env(&self, record: &ImportRecord) -> Vec<(String, String)> {
        let mut envs = self.config.pg.as_env();
        envs.push((
            "DATASET_TMP_DIR".to_string(),
            self.config.tmp_dir.display().to_string(),
        ));
        envs.push((
            "DATASET_IMPORT_VERBOSE".to_string(),
            self.config.import_script_verbose.to_string(),
        ));
        envs.push((
            "DATASET_FEED_DIGEST".to_string(),
            record.feed_digest.clone(),
        ));
        envs.push((
            "DATASET_IMPORT_SCHEMA".to_string(),
            record.schema_name.clone(),
        ));
        if let Some(tidy) = self.config.tidy_before_import {
            envs.push(("DATASET_TIDY_BEFORE_IMPORT".to_string(), tidy.to_string()));
        }
        if let Some(dir) = &self.config.postprocessing_dir {
            envs.push((
                "DATASET_POSTPROCESSING_D_PATH".to_string(),
                dir.display().to_string(),
            ));
        }
        envs
    }

    /// Feed digest of the downloaded archive, optionally folded with the
    /// post-processing files' fingerprints.
    async fn compute_feed_digest(&self, archive_path: &Path) -> Result<String> {
        let archive_digest = digest::digest_file(archive_path).await?;

        let Some(dir) = &self.config.postprocessing_dir else {
            return Ok(archive_digest);
        };
        let mut files = Vec::new();
        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_name().to_string_lossy().starts_with('.') {
                        continue;
                    }
                    files.push(entry.path());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(archive_digest);
            }
            Err(err) => return Err(err.into()),
        }
        if files.is_empty() {
            return Ok(archive_digest);
        }

        files.sort();
        debug!(
            "folding {} post-processing file(s) into the feed digest",
            files.len()
        );
        let files_digest = digest::digest_files(&files).await?;
        Ok(digest::combine(&archive_digest, &files_digest))
    }

    /// Drop everything the retention policy does not keep, deleting each
    /// schema's import record only after the schema itself is gone.
    async fn sweep(&mut self) -> Result<(Vec<String>, Vec<String>)> {
        info!("cleaning up old schemas (after successful import)");
        let mut inventory = self.store.list_imports().await?;
        reconcile(&mut inventory);

        let retained = self
            .config
            .retention
            .schemas_to_retain(&inventory.successful_imports, &inventory.all_schemas);
        debug!("schemas to retain after import: {}", retained.join(", "));

        let mut deleted = Vec::new();
        for schema_name in &inventory.all_schemas {
            if retained.contains(schema_name) {
                continue;
            }
            let had_record = inventory.has_record_for(schema_name);
            if had_record {
                info!(
                    "dropping schema \"{}\" containing a (recent) successful import",
                    schema_name
                );
            } else {
                info!(
                    "dropping schema \"{}\" containing an older or unfinished import",
                    schema_name
                );
            }

            match self.store.drop_schema(schema_name).await {
                Ok(()) => {
                    deleted.push(schema_name.clone());
                    if had_record {
                        // Only after the schema is confirmed gone; the
                        // reverse order could leave a record pointing at
                        // nothing.
                        self.store.delete_import_record(schema_name).await?;
                    }
                }
                Err(err) if self.config.continue_on_failure_deleting_old_schema => {
                    warn!(
                        "failed to delete old schema \"{}\": {}",
                        schema_name, err
                    );
                }
                Err(err) => {
                    return Err(ImportError::Sweep {
                        schema: schema_name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok((deleted, retained))
    }
}

/// Drop records pointing at schemas that are not in the catalog. That
/// state indicates a bug or external tampering; the durable table is left
/// alone, only the in-memory view for this run is cleaned.
fn reconcile(inventory: &mut ImportInventory) {
    let ImportInventory {
        successful_imports,
        all_schemas,
    } = inventory;
    successful_imports.retain(|record| {
        if all_schemas.contains(&record.schema_name) {
            true
        } else {
            warn!(
                "the \"{}\" table points to a schema \"{}\" which does not exist. \
                 This indicates either a bug or that the bookkeeping state has \
                 been tampered with!",
                IMPORTS_TABLE, record.schema_name
            );
            false
        }
    });
}
