use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ck_crypto::{exchange::derive_shared_secret, KeyExchange, KeyPair};
use ck_proto::EncryptedBackup;
use ck_store::{Session, Store};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

mod config;
mod paths;
mod prompt;

#[derive(Parser, Debug)]
#[command(name = "cipherkeep", author, version, about = "Cipherkeep end-to-end encryption key store", long_about = None)]
struct Cli {
    /// Directory holding keys.db and config.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Identity key pairs
    #[command(subcommand)]
    Keypair(KeypairCommand),

    /// Conversation keys and rotation
    #[command(subcommand)]
    Conversation(ConversationCommand),

    /// Password-protected backup and recovery
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Delete every key pair, conversation key and rotation record
    Clear {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KeypairCommand {
    /// Generate a new X25519 key pair and store it sealed under a password
    Generate { id: String },
    /// List stored key pairs with their public keys
    List,
    /// Print the base64 public key
    Export { id: String },
    /// Delete a key pair
    Delete { id: String },
}

/// Which local key pair and which peer to agree a secret with.
#[derive(Args, Debug)]
struct PeerArgs {
    /// Id of the local key pair
    #[arg(long)]
    key_id: String,
    /// Peer public key, base64
    #[arg(long)]
    peer: String,
}

#[derive(Subcommand, Debug)]
enum ConversationCommand {
    /// Derive a conversation key from a key agreement and store it
    Derive {
        conversation_id: String,
        #[command(flatten)]
        peer: PeerArgs,
        #[arg(long, default_value_t = 1)]
        version: u32,
    },
    /// Show version and timestamps (no password needed)
    Info { conversation_id: String },
    /// List conversations with a stored key
    List,
    /// Replace the key with the next version
    Rotate {
        conversation_id: String,
        #[command(flatten)]
        peer: PeerArgs,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Show the rotation history
    History { conversation_id: String },
    /// Delete the stored key (history is kept)
    Delete { conversation_id: String },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Write an encrypted backup of the whole store
    Create {
        /// Output file; stdout if omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Restore rows from an encrypted backup file
    Restore { file: PathBuf },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyPairSummary {
    id: String,
    public_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data = paths::data_dir(cli.data_dir.as_deref())?;
    std::fs::create_dir_all(&data)
        .with_context(|| format!("creating data directory {}", data.display()))?;
    let config = config::load(cli.config.as_deref(), &paths::config_path(&data))?;
    let store = Store::open(&paths::database_path(&data), config).await?;

    let result = match cli.command {
        Commands::Keypair(cmd) => keypair_command(&store, cmd).await,
        Commands::Conversation(cmd) => conversation_command(&store, cmd).await,
        Commands::Backup(cmd) => backup_command(&store, cmd).await,
        Commands::Clear { yes } => clear_command(&store, yes).await,
    };
    store.close().await;
    result
}

async fn keypair_command(store: &Store, cmd: KeypairCommand) -> Result<()> {
    match cmd {
        KeypairCommand::Generate { id } => {
            let kx = KeyExchange::new();
            kx.ready()?;
            let pair = kx.generate_key_pair()?;
            let password = prompt::new_password(&format!("Password for key pair '{id}': "))?;
            store.store_key_pair(&id, &pair, &password).await?;
            println!("{}", pair.public_b64());
        }
        KeypairCommand::List => {
            let mut out = Vec::new();
            for id in store.get_all_key_pair_ids().await? {
                let public_key = store.export_public_key(&id).await?.unwrap_or_default();
                out.push(KeyPairSummary { id, public_key });
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        KeypairCommand::Export { id } => {
            let public = store
                .export_public_key(&id)
                .await?
                .ok_or_else(|| anyhow!("no key pair '{id}'"))?;
            println!("{public}");
        }
        KeypairCommand::Delete { id } => {
            if !store.delete_key_pair(&id).await? {
                bail!("no key pair '{id}'");
            }
        }
    }
    Ok(())
}

async fn conversation_command(store: &Store, cmd: ConversationCommand) -> Result<()> {
    match cmd {
        ConversationCommand::Derive { conversation_id, peer, version } => {
            let secret = agree(store, &peer).await?;
            let key = store.derive_conversation_key(secret.as_bytes(), &conversation_id, version)?;
            let session = unlock(store).await?;
            store.store_conversation_key(&session, &conversation_id, &key, version).await?;
            session.clear().await;
            println!("stored {conversation_id} v{version}");
        }
        ConversationCommand::Info { conversation_id } => {
            let info = store
                .get_conversation_key_info(&conversation_id)
                .await?
                .ok_or_else(|| anyhow!("no key for conversation {conversation_id}"))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        ConversationCommand::List => {
            for id in store.get_all_conversation_ids().await? {
                println!("{id}");
            }
        }
        ConversationCommand::Rotate { conversation_id, peer, reason } => {
            let secret = agree(store, &peer).await?;
            let session = unlock(store).await?;
            let record = store
                .rotate_conversation_key(&session, &conversation_id, secret.as_bytes(), &reason)
                .await?;
            session.clear().await;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        ConversationCommand::History { conversation_id } => {
            let history = store.get_rotation_history(&conversation_id).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        ConversationCommand::Delete { conversation_id } => {
            if !store.delete_conversation_key(&conversation_id).await? {
                bail!("no key for conversation {conversation_id}");
            }
        }
    }
    Ok(())
}

async fn backup_command(store: &Store, cmd: BackupCommand) -> Result<()> {
    match cmd {
        BackupCommand::Create { out } => {
            let password = prompt::new_password("Backup password: ")?;
            let backup = store.create_backup(&password).await?;
            let json = backup.to_json()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing backup {}", path.display()))?;
                    info!(path = %path.display(), "backup written");
                }
                None => println!("{json}"),
            }
        }
        BackupCommand::Restore { file } => {
            let backup = read_backup(&file)?;
            let password = prompt::password("Backup password: ")?;
            let summary = store.restore_backup(&backup, &password).await?;
            println!(
                "restored {} key pairs, {} conversation keys, {} rotation records",
                summary.key_pairs, summary.conversation_keys, summary.rotation_records
            );
        }
    }
    Ok(())
}

async fn clear_command(store: &Store, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clear the key store without --yes");
    }
    store.clear_all().await?;
    Ok(())
}

/// Unseal the local key pair and run X25519 against the peer's public key.
async fn agree(store: &Store, args: &PeerArgs) -> Result<ck_crypto::SharedSecret> {
    let peer = STANDARD
        .decode(args.peer.trim())
        .context("peer public key is not valid base64")?;
    let password = prompt::password(&format!("Password for key pair '{}': ", args.key_id))?;
    let pair: KeyPair = store
        .get_key_pair(&args.key_id, &password)
        .await
        .into_result()?
        .ok_or_else(|| anyhow!("no key pair '{}'", args.key_id))?;
    Ok(derive_shared_secret(pair.private_key(), &peer)?)
}

async fn unlock(store: &Store) -> Result<Session> {
    let session = store.new_session().await;
    let password = prompt::master_password()?;
    store.unlock_session(&session, &password).await?;
    Ok(session)
}

fn read_backup(path: &Path) -> Result<EncryptedBackup> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading backup {}", path.display()))?;
    Ok(EncryptedBackup::from_json(&raw)?)
}
