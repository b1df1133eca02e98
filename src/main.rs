use anyhow::Context;
use clap::{Parser, Subcommand};
use chat_vault_lib::backup_config::{backup_directory_uri, last_backup_time, PREF_BACKUP_DIRECTORY};
use chat_vault_lib::logging::init_tracing;
use chat_vault_lib::{
    BackupOutcome, BackupSession, DocumentTreeProvider, EngineConfig, LocalTreeProvider,
    PreferenceStore, SqlitePreferenceStore, TreeUri,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chat-vault")]
#[command(about = "Chat database backup and restore")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the live database
    Backup {
        /// Also copy the media directory
        #[arg(long)]
        media: bool,
    },
    /// Restore the live database from the first usable backup
    Restore {
        /// Also restore the media directory
        #[arg(long)]
        media: bool,
    },
    /// Show the current backup location and last backup
    Status,
    /// Delete the backup directory at the current location
    Delete,
    /// Grant a local directory as the backup location
    Grant {
        /// Directory to use
        path: PathBuf,
    },
    /// Revoke the granted directory and fall back to the direct path
    Revoke,
}

struct Host {
    session: BackupSession,
    prefs: Arc<SqlitePreferenceStore>,
    provider: Arc<LocalTreeProvider>,
}

fn open_host(config: EngineConfig) -> anyhow::Result<Host> {
    let prefs = Arc::new(
        SqlitePreferenceStore::open(config.data_dir.join("preferences.db"))
            .context("打开偏好存储失败")?,
    );
    let provider = Arc::new(
        LocalTreeProvider::open(config.data_dir.join("tree_grants.json"))
            .context("加载目录授权失败")?,
    );
    let session = BackupSession::builder(config)
        .preferences(prefs.clone())
        .tree_provider(provider.clone() as Arc<dyn DocumentTreeProvider>)
        .build()
        .context("创建备份会话失败")?;
    Ok(Host {
        session,
        prefs,
        provider,
    })
}

fn exit_code(outcome: BackupOutcome) -> i32 {
    match outcome {
        BackupOutcome::Success => 0,
        BackupOutcome::NotFound => 2,
        BackupOutcome::NoAvailableStorage => 3,
        BackupOutcome::Failure => 1,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = EngineConfig::from_env_and_file().context("加载配置失败")?;
    let host = open_host(config)?;

    match cli.command {
        Commands::Backup { media } => {
            let outcome = host.session.backup(media).await;
            println!("backup: {}", outcome);
            std::process::exit(exit_code(outcome));
        }
        Commands::Restore { media } => {
            let outcome = host.session.restore(media).await;
            println!("restore: {}", outcome);
            std::process::exit(exit_code(outcome));
        }
        Commands::Status => {
            let location = backup_directory_uri(host.prefs.as_ref())?
                .unwrap_or_else(|| "direct path".to_string());
            println!("location:   {}", location);
            println!(
                "accessible: {}",
                host.session.can_access_backup_directory().await
            );
            match host.session.backup_status().await {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("no backup found"),
            }
            if let Some(at) = last_backup_time(host.prefs.as_ref()) {
                println!("last run:   {}", at.to_rfc3339());
            }
        }
        Commands::Delete => {
            let deleted = host.session.delete_backup().await;
            println!("deleted: {}", deleted);
        }
        Commands::Grant { path } => {
            let tree = host.provider.grant(&path, true, true)?;
            host.prefs.put_string(PREF_BACKUP_DIRECTORY, tree.as_str())?;
            info!("备份位置已切换到 {}", tree);
            println!("{}", tree);
        }
        Commands::Revoke => {
            match backup_directory_uri(host.prefs.as_ref())? {
                Some(uri) => {
                    let tree = TreeUri::parse(&uri)?;
                    if !host.provider.revoke(&tree)? {
                        warn!("授权表中没有 {}", tree);
                    }
                    host.prefs.remove(PREF_BACKUP_DIRECTORY)?;
                    println!("revoked {}", tree);
                }
                None => println!("no granted directory"),
            }
        }
    }
    Ok(())
}
