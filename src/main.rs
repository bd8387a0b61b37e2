//! vaultcore - Per-user encrypted file vault
//!
//! Usage:
//!   vaultcore init                            - Write a config and create the storage roots
//!   vaultcore upload --owner <id> <file>      - Encrypt and store a file
//!   vaultcore list --owner <id>               - List stored files
//!   vaultcore download --owner <id> <file-id> - Decrypt a file
//!   vaultcore export --owner <id> -o <zip>    - Export every file as a ZIP archive
//!   vaultcore status                          - Show storage status

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vaultcore::{
    config::{LoggingConfig, VaultConfig},
    record::SledRecordStore,
    staging::{StagingArea, StagingClass, STALE_AFTER},
    VaultService,
};

#[derive(Parser)]
#[command(name = "vaultcore")]
#[command(author = "vaultcore Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-user encrypted file vault")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/vaultcore/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the storage roots
    Init {
        /// Data directory (defaults to the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Encrypt and store a local file
    Upload {
        /// Owner id
        #[arg(long)]
        owner: String,

        /// File to upload
        file: PathBuf,

        /// Stored filename (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// List an owner's files
    List {
        /// Owner id
        #[arg(long)]
        owner: String,
    },

    /// Decrypt a stored file
    Download {
        /// Owner id
        #[arg(long)]
        owner: String,

        /// File id
        id: String,

        /// Output path (defaults to the stored filename in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a stored file
    Delete {
        /// Owner id
        #[arg(long)]
        owner: String,

        /// File id
        id: String,
    },

    /// Delete every file of an owner
    DeleteAll {
        /// Owner id
        #[arg(long)]
        owner: String,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Export every file of an owner as a ZIP archive
    Export {
        /// Owner id
        #[arg(long)]
        owner: String,

        /// Archive path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show storage status
    Status,

    /// Remove all plaintext from the transient staging roots (stop other vault processes first)
    Purge,
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Setup logging
    if let Err(e) = init_logging(&config.logging, cli.verbose) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path, config) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Load the config file if present, otherwise defaults plus environment
fn load_config(path: &Path) -> Result<VaultConfig> {
    if path.exists() {
        Ok(VaultConfig::load(path)?)
    } else {
        Ok(VaultConfig::from_env()?)
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &logging.file {
        Some(file) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .with_context(|| format!("failed to open log file {:?}", file))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn run_command(command: Commands, config_path: &Path, config: VaultConfig) -> Result<()> {
    match command {
        Commands::Init { data_dir, force } => cmd_init(config_path, config, data_dir, force),

        Commands::Upload { owner, file, name } => block_on(async {
            let vault = open_vault(&config)?;
            cmd_upload(&vault, &owner, &file, name).await
        }),

        Commands::List { owner } => block_on(async {
            let vault = open_vault(&config)?;
            cmd_list(&vault, &owner).await
        }),

        Commands::Download { owner, id, output } => block_on(async {
            let vault = open_vault(&config)?;
            cmd_download(&vault, &owner, &id, output).await
        }),

        Commands::Delete { owner, id } => block_on(async {
            let vault = open_vault(&config)?;
            cmd_delete(&vault, &owner, &id).await
        }),

        Commands::DeleteAll { owner, yes } => block_on(async {
            let vault = open_vault(&config)?;
            cmd_delete_all(&vault, &owner, yes).await
        }),

        Commands::Export { owner, output } => block_on(async {
            let vault = open_vault(&config)?;
            cmd_export(&vault, &owner, &output).await
        }),

        Commands::Status => cmd_status(config_path, &config),

        Commands::Purge => cmd_purge(&config),
    }
}

fn block_on<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(future)
}

fn open_vault(config: &VaultConfig) -> Result<VaultService> {
    config.ensure_directories()?;

    let store = SledRecordStore::open(config.record_db_path())
        .with_context(|| format!("failed to open record store {:?}", config.record_db_path()))?;
    let vault = VaultService::from_config(config, Arc::new(store))?;

    // Plaintext left behind by a crashed process; other processes share these roots
    for class in StagingClass::ALL.into_iter().filter(|c| c.is_transient()) {
        vault.staging().purge_stale(class, STALE_AFTER)?;
    }
    Ok(vault)
}

fn cmd_init(config_path: &Path, mut config: VaultConfig, data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!("config already exists at {:?} (use --force to overwrite)", config_path);
    }

    if let Some(dir) = data_dir {
        config.data_dir = expand_tilde(&dir);
    }
    config.validate()?;
    config.ensure_directories()?;
    config.save(config_path)?;

    info!("Initialized vault in {:?}", config.data_dir);
    println!("Configuration written to {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    Ok(())
}

async fn cmd_upload(vault: &VaultService, owner: &str, file: &Path, name: Option<String>) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a filename from {:?}", file))?,
    };

    let mut input = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open {:?}", file))?;
    let record = vault.upload(owner, &name, &mut input).await?;

    println!("{}  {}  {} bytes", record.id, record.filename, record.size_bytes);
    Ok(())
}

async fn cmd_list(vault: &VaultService, owner: &str) -> Result<()> {
    let records = vault.list(owner).await?;
    if records.is_empty() {
        println!("No files stored for {}", owner);
        return Ok(());
    }

    println!("{:<36}  {:>12}  {:<20}  FILENAME", "ID", "SIZE", "UPLOADED");
    for record in records {
        println!(
            "{:<36}  {:>12}  {:<20}  {}",
            record.id,
            record.size_bytes,
            record.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            record.filename
        );
    }
    Ok(())
}

async fn cmd_download(vault: &VaultService, owner: &str, id: &str, output: Option<PathBuf>) -> Result<()> {
    let output = match output {
        Some(path) => path,
        None => {
            let record = vault.get(owner, id).await?;
            Path::new(&record.filename)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("download"))
        }
    };

    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&output)
        .await
        .with_context(|| format!("failed to create {:?}", output))?;

    match vault.download_to(owner, id, &mut out).await {
        Ok(n) => {
            out.sync_all().await?;
            println!("Wrote {} bytes to {:?}", n, output);
            Ok(())
        }
        Err(e) => {
            drop(out);
            let _ = tokio::fs::remove_file(&output).await;
            Err(e.into())
        }
    }
}

async fn cmd_delete(vault: &VaultService, owner: &str, id: &str) -> Result<()> {
    let record = vault.delete(owner, id).await?;
    println!("Deleted {} ({})", record.id, record.filename);
    Ok(())
}

async fn cmd_delete_all(vault: &VaultService, owner: &str, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to delete every file of {} without --yes", owner);
    }

    let removed = vault.delete_all_for_owner(owner).await?;
    println!("Deleted {} files", removed);
    Ok(())
}

async fn cmd_export(vault: &VaultService, owner: &str, output: &Path) -> Result<()> {
    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .await
        .with_context(|| format!("failed to create {:?}", output))?;

    match vault.export_to(owner, &mut out).await {
        Ok(n) => {
            out.flush().await?;
            out.sync_all().await?;
            println!("Exported {} bytes to {:?}", n, output);
            Ok(())
        }
        Err(e) => {
            drop(out);
            let _ = tokio::fs::remove_file(output).await;
            Err(e.into())
        }
    }
}

fn cmd_status(config_path: &Path, config: &VaultConfig) -> Result<()> {
    println!("vaultcore Status");
    println!("================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Chunk size: {} KB", config.cipher.chunk_size / 1024);
    println!("Compression level: {}", config.archive.compression_level);

    let db_path = config.record_db_path();
    if db_path.exists() {
        let store = SledRecordStore::open(&db_path)?;
        println!("Records: {}", store.len());
    } else {
        println!("Records: (no record store yet, run 'vaultcore init')");
    }

    println!();
    let staging = StagingArea::new(config.staging_roots());
    for class in StagingClass::ALL {
        let files = staging.residue(class)?;
        println!(
            "{:<12} {:>6} files  {:?}",
            class.as_str(),
            files.len(),
            staging.roots().root(class)
        );
    }
    Ok(())
}

fn cmd_purge(config: &VaultConfig) -> Result<()> {
    let staging = StagingArea::new(config.staging_roots());

    let mut total = 0;
    for class in StagingClass::ALL.into_iter().filter(|c| c.is_transient()) {
        total += staging.purge(class)?;
    }

    println!("Purged {} files", total);
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
