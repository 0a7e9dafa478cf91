//! Shared helpers for coordinator tests: an in-memory bookkeeping fake
//! and stub download/import scripts.

use async_trait::async_trait;
use dataset_importer::bookkeeping::{Bookkeeping, ImportInventory, ImportRecord};
use dataset_importer::config::{ImporterConfig, PgConfig};
use dataset_importer::error::{ImportError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// In-memory stand-in for the Postgres store. The stub import script
/// cannot create schemas, so recording an import also makes its schema
/// visible in the fake catalog.
#[derive(Default)]
pub struct MemoryBookkeeping {
    pub records: Vec<ImportRecord>,
    pub schemas: BTreeSet<String>,
    pub lock_held: bool,
    /// Simulates another session holding the import lock.
    pub externally_locked: bool,
    /// Schemas whose destruction fails.
    pub fail_dropping: BTreeSet<String>,
    pub fail_record_import: bool,
    pub granted: Vec<(String, Vec<String>)>,
    /// Chronological log of mutating operations.
    pub ops: Vec<String>,
}

impl MemoryBookkeeping {
    pub fn with_history(history: &[(i64, &str)]) -> Self {
        let mut store = Self::default();
        for (imported_at, feed_digest) in history {
            let schema_name = format!("dataset_{}", imported_at);
            store.schemas.insert(schema_name.clone());
            store.records.push(ImportRecord {
                schema_name,
                imported_at: *imported_at,
                feed_digest: feed_digest.to_string(),
            });
        }
        store
    }

    pub fn add_orphan(&mut self, schema_name: &str) {
        self.schemas.insert(schema_name.to_string());
    }

    pub fn record_for(&self, schema_name: &str) -> Option<&ImportRecord> {
        self.records
            .iter()
            .find(|record| record.schema_name == schema_name)
    }
}

#[async_trait]
impl Bookkeeping for MemoryBookkeeping {
    async fn ensure_exists(&mut self) -> Result<()> {
        Ok(())
    }

    async fn try_acquire_import_lock(&mut self) -> Result<bool> {
        if self.externally_locked {
            return Ok(false);
        }
        self.lock_held = true;
        Ok(true)
    }

    async fn release_import_lock(&mut self) -> Result<()> {
        self.lock_held = false;
        Ok(())
    }

    async fn list_imports(&mut self) -> Result<ImportInventory> {
        let mut successful_imports = self.records.clone();
        successful_imports.sort_by(|a, b| b.imported_at.cmp(&a.imported_at));
        Ok(ImportInventory {
            successful_imports,
            all_schemas: self.schemas.iter().cloned().collect(),
        })
    }

    async fn record_import(&mut self, record: &ImportRecord) -> Result<()> {
        if self.fail_record_import {
            return Err(ImportError::Configuration(
                "injected commit failure".to_string(),
            ));
        }
        if self.record_for(&record.schema_name).is_some() {
            return Err(ImportError::DuplicateImportRecord {
                schema: record.schema_name.clone(),
            });
        }
        self.records.push(record.clone());
        self.schemas.insert(record.schema_name.clone());
        self.ops.push(format!("record:{}", record.schema_name));
        Ok(())
    }

    async fn delete_import_record(&mut self, schema_name: &str) -> Result<()> {
        self.records.retain(|record| record.schema_name != schema_name);
        self.ops.push(format!("delete_record:{}", schema_name));
        Ok(())
    }

    async fn drop_schema(&mut self, schema_name: &str) -> Result<()> {
        if self.fail_dropping.contains(schema_name) {
            return Err(ImportError::Configuration(format!(
                "injected failure dropping {}",
                schema_name
            )));
        }
        self.schemas.remove(schema_name);
        self.ops.push(format!("drop:{}", schema_name));
        Ok(())
    }

    async fn grant_read_access(&mut self, schema_name: &str, roles: &[String]) -> Result<()> {
        self.granted
            .push((schema_name.to_string(), roles.to_vec()));
        self.ops.push(format!("grant:{}", schema_name));
        Ok(())
    }
}

/// Write an executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Download stub that "downloads" the given bytes into the archive path.
pub fn write_download_script(dir: &Path, content: &str) -> PathBuf {
    write_script(
        dir,
        "download.sh",
        &format!(
            "mkdir -p \"$DATASET_TMP_DIR\"\nprintf '%s' '{}' > \"$DATASET_TMP_DIR/dataset.zip\"",
            content
        ),
    )
}

pub fn test_pg() -> PgConfig {
    PgConfig {
        host: "localhost".to_string(),
        port: 5432,
        user: "postgres".to_string(),
        password: "secret".to_string(),
        database: "datasets".to_string(),
    }
}

/// Config wired to stub scripts under `dir`, quiet stdout.
pub fn test_config(dir: &Path, download_script: PathBuf, import_script: PathBuf) -> ImporterConfig {
    let mut config = ImporterConfig::new(
        "https://example.org/feed.zip",
        "importer-test",
        download_script,
        import_script,
        test_pg(),
    );
    config.tmp_dir = dir.join("tmp");
    config.forward_download_stdout = false;
    config.forward_import_stdout = false;
    config
}
