//! Importer configuration.
//!
//! The coordinator takes an explicit config struct; nothing in the library
//! reads the process environment. The CLI binary is the only place where
//! environment variables and flags are folded into an [`ImporterConfig`].

use crate::error::{ImportError, Result};
use crate::retention::{KeepMostRecent, RetentionPolicy};
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::sync::Arc;

/// Connection parameters for the database holding the bookkeeping table
/// and the dataset schemas.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl PgConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    /// libpq-style environment passed to the transform subprocess.
    pub fn as_env(&self) -> Vec<(String, String)> {
        vec![
            ("PGHOST".to_string(), self.host.clone()),
            ("PGPORT".to_string(), self.port.to_string()),
            ("PGUSER".to_string(), self.user.clone()),
            ("PGPASSWORD".to_string(), self.password.clone()),
            ("PGDATABASE".to_string(), self.database.clone()),
        ]
    }
}

/// Where (and as whom) to write the post-commit connection-string file.
#[derive(Debug, Clone)]
pub struct DsnFileConfig {
    pub path: PathBuf,
    pub user: String,
    pub password: String,
}

/// Downstream read-serving layer whose exposed-schema settings are
/// updated after a successful import.
#[derive(Debug, Clone)]
pub struct ReadLayerConfig {
    /// Settings endpoint (read with GET, updated with PATCH).
    pub api_url: String,
    pub access_token: String,
    /// Roles granted access to each newly imported schema.
    pub roles: Vec<String>,
}

pub struct ImporterConfig {
    pub download_url: String,
    pub download_user_agent: String,
    /// Working directory for the downloaded archive.
    pub tmp_dir: PathBuf,
    pub download_script: PathBuf,
    pub import_script: PathBuf,
    pub download_script_verbose: bool,
    pub forward_download_stdout: bool,
    pub import_script_verbose: bool,
    pub forward_import_stdout: bool,
    /// Content-hygiene preprocessing toggle handed to the import script.
    pub tidy_before_import: Option<bool>,
    /// Directory of post-processing files folded into the feed digest.
    pub postprocessing_dir: Option<PathBuf>,
    /// Keep sweeping when one old schema fails to drop instead of
    /// failing the whole run.
    pub continue_on_failure_deleting_old_schema: bool,
    pub retention: Arc<dyn RetentionPolicy>,
    pub dsn_file: Option<DsnFileConfig>,
    pub read_layer: Option<ReadLayerConfig>,
    pub pg: PgConfig,
}

impl ImporterConfig {
    pub fn new(
        download_url: impl Into<String>,
        download_user_agent: impl Into<String>,
        download_script: impl Into<PathBuf>,
        import_script: impl Into<PathBuf>,
        pg: PgConfig,
    ) -> Self {
        Self {
            download_url: download_url.into(),
            download_user_agent: download_user_agent.into(),
            tmp_dir: PathBuf::from("/tmp/dataset"),
            download_script: download_script.into(),
            import_script: import_script.into(),
            download_script_verbose: true,
            forward_download_stdout: true,
            import_script_verbose: true,
            forward_import_stdout: true,
            tidy_before_import: None,
            postprocessing_dir: None,
            continue_on_failure_deleting_old_schema: false,
            retention: Arc::new(KeepMostRecent::default()),
            dsn_file: None,
            read_layer: None,
            pg,
        }
    }

    /// Path the download script is expected to leave the archive at.
    pub fn archive_path(&self) -> PathBuf {
        self.tmp_dir.join("dataset.zip")
    }

    /// Fail fast before any external side effect.
    pub fn validate(&self) -> Result<()> {
        if self.download_url.is_empty() {
            return Err(ImportError::Configuration(
                "missing/empty download_url".to_string(),
            ));
        }
        if self.download_user_agent.is_empty() {
            return Err(ImportError::Configuration(
                "missing/empty download_user_agent".to_string(),
            ));
        }
        if self.download_script.as_os_str().is_empty() {
            return Err(ImportError::Configuration(
                "missing/empty download_script".to_string(),
            ));
        }
        if self.import_script.as_os_str().is_empty() {
            return Err(ImportError::Configuration(
                "missing/empty import_script".to_string(),
            ));
        }
        if let Some(dsn) = &self.dsn_file {
            if dsn.user.is_empty() || dsn.password.is_empty() {
                return Err(ImportError::Configuration(
                    "dsn_file requires a user and a password".to_string(),
                ));
            }
        }
        if let Some(read_layer) = &self.read_layer {
            if read_layer.api_url.is_empty() || read_layer.access_token.is_empty() {
                return Err(ImportError::Configuration(
                    "read_layer requires an api_url and an access_token".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pg() -> PgConfig {
        PgConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "secret".to_string(),
            database: "datasets".to_string(),
        }
    }

    fn test_config() -> ImporterConfig {
        ImporterConfig::new(
            "https://example.org/feed.zip",
            "importer-test",
            "/usr/local/bin/download.sh",
            "/usr/local/bin/import.sh",
            test_pg(),
        )
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_empty_download_url_fails() {
        let mut cfg = test_config();
        cfg.download_url = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }

    #[test]
    fn test_empty_user_agent_fails() {
        let mut cfg = test_config();
        cfg.download_user_agent = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_dsn_file_requires_credentials() {
        let mut cfg = test_config();
        cfg.dsn_file = Some(DsnFileConfig {
            path: PathBuf::from("/var/run/dataset.dsn"),
            user: "reader".to_string(),
            password: String::new(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pg_env_projection() {
        let env = test_pg().as_env();
        assert!(env.contains(&("PGHOST".to_string(), "localhost".to_string())));
        assert!(env.contains(&("PGPORT".to_string(), "5432".to_string())));
        assert!(env.contains(&("PGDATABASE".to_string(), "datasets".to_string())));
    }

    #[test]
    fn test_archive_path_under_tmp_dir() {
        let cfg = test_config();
        assert_eq!(cfg.archive_path(), PathBuf::from("/tmp/dataset/dataset.zip"));
    }
}
