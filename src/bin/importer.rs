use anyhow::{anyhow, Result};
use clap::Parser;
use dataset_importer::bookkeeping::PgBookkeeping;
use dataset_importer::config::{DsnFileConfig, ImporterConfig, PgConfig, ReadLayerConfig};
use dataset_importer::coordinator::ImportCoordinator;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "importer")]
#[command(about = "Atomically import a transit feed dataset into Postgres")]
struct Args {
    /// Feed download URL (or set DATASET_DOWNLOAD_URL)
    #[arg(long)]
    download_url: Option<String>,

    /// User agent sent by the download script (or DATASET_DOWNLOAD_USER_AGENT)
    #[arg(long)]
    user_agent: Option<String>,

    /// Working directory for the downloaded archive (or DATASET_TMP_DIR)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Download script path (or DATASET_DOWNLOAD_SCRIPT)
    #[arg(long)]
    download_script: Option<PathBuf>,

    /// Import script path (or DATASET_IMPORT_SCRIPT)
    #[arg(long)]
    import_script: Option<PathBuf>,

    /// Write a connection string for the new schema to this file
    /// (or DATASET_IMPORTER_DSN_FILE)
    #[arg(long)]
    dsn_file: Option<PathBuf>,

    /// Keep sweeping when deleting an old schema fails
    #[arg(long)]
    continue_on_sweep_failure: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn env_or(flag: Option<String>, var: &str) -> Option<String> {
    flag.or_else(|| std::env::var(var).ok()).filter(|v| !v.is_empty())
}

fn env_flag(var: &str) -> bool {
    std::env::var(var).map(|v| v == "true").unwrap_or(false)
}

fn build_config(args: &Args) -> Result<ImporterConfig> {
    let download_url = env_or(args.download_url.clone(), "DATASET_DOWNLOAD_URL")
        .ok_or_else(|| anyhow!("missing --download-url / DATASET_DOWNLOAD_URL"))?;
    let user_agent = env_or(args.user_agent.clone(), "DATASET_DOWNLOAD_USER_AGENT")
        .ok_or_else(|| anyhow!("missing --user-agent / DATASET_DOWNLOAD_USER_AGENT"))?;
    let download_script = args
        .download_script
        .clone()
        .or_else(|| std::env::var("DATASET_DOWNLOAD_SCRIPT").ok().map(PathBuf::from))
        .ok_or_else(|| anyhow!("missing --download-script / DATASET_DOWNLOAD_SCRIPT"))?;
    let import_script = args
        .import_script
        .clone()
        .or_else(|| std::env::var("DATASET_IMPORT_SCRIPT").ok().map(PathBuf::from))
        .ok_or_else(|| anyhow!("missing --import-script / DATASET_IMPORT_SCRIPT"))?;

    let pg = PgConfig {
        host: env_or(None, "PGHOST").unwrap_or_else(|| "localhost".to_string()),
        port: env_or(None, "PGPORT")
            .map(|port| port.parse())
            .transpose()?
            .unwrap_or(5432),
        user: env_or(None, "PGUSER").unwrap_or_else(|| "postgres".to_string()),
        password: env_or(None, "PGPASSWORD")
            .ok_or_else(|| anyhow!("missing/empty $PGPASSWORD"))?,
        database: env_or(None, "PGDATABASE")
            .ok_or_else(|| anyhow!("missing/empty $PGDATABASE"))?,
    };

    let mut config = ImporterConfig::new(download_url, user_agent, download_script, import_script, pg);

    if let Some(tmp_dir) = env_or(
        args.tmp_dir.as_ref().map(|p| p.display().to_string()),
        "DATASET_TMP_DIR",
    ) {
        config.tmp_dir = PathBuf::from(tmp_dir);
    }

    config.postprocessing_dir = Some(
        env_or(None, "DATASET_POSTPROCESSING_D_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/dataset/postprocessing.d")),
    );

    config.tidy_before_import = env_or(None, "DATASET_TIDY_BEFORE_IMPORT")
        .map(|v| v == "true");

    config.continue_on_failure_deleting_old_schema = args.continue_on_sweep_failure
        || env_flag("DATASET_CONTINUE_ON_FAILURE_DELETING_OLD_SCHEMA");

    if let Some(path) = env_or(
        args.dsn_file.as_ref().map(|p| p.display().to_string()),
        "DATASET_IMPORTER_DSN_FILE",
    ) {
        config.dsn_file = Some(DsnFileConfig {
            path: PathBuf::from(path),
            user: env_or(None, "DATASET_DSN_USER")
                .ok_or_else(|| anyhow!("missing/empty $DATASET_DSN_USER"))?,
            password: env_or(None, "DATASET_DSN_PASSWORD")
                .ok_or_else(|| anyhow!("missing/empty $DATASET_DSN_PASSWORD"))?,
        });
    }

    if let (Some(api_url), Some(access_token)) = (
        env_or(None, "READ_LAYER_API_URL"),
        env_or(None, "READ_LAYER_ACCESS_TOKEN"),
    ) {
        let roles = env_or(None, "READ_LAYER_ROLES")
            .unwrap_or_else(|| "anon, authenticated, service_role".to_string())
            .split(',')
            .map(|role| role.trim().to_string())
            .filter(|role| !role.is_empty())
            .collect();
        config.read_layer = Some(ReadLayerConfig {
            api_url,
            access_token,
            roles,
        });
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let mut store = PgBookkeeping::connect(config.pg.connect_options()).await?;
    let outcome = ImportCoordinator::new(&config, &mut store).run().await?;
    store.close().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.import_skipped {
        info!("import skipped, nothing changed");
    } else if let Some(new_import) = &outcome.new_import {
        info!(
            "imported into \"{}\" in {}ms ({} old schema(s) deleted)",
            new_import.schema_name,
            outcome.import_duration_ms.unwrap_or(0),
            outcome.deleted_schemas.len()
        );
    }
    Ok(())
}
