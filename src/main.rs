//! StackSnap - Main entry point
//!
//! CLI caller for the backup/restore pipeline core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stacksnap::config::AppConfig;
use stacksnap::crypto::recovery::{create_recovery_kit, recover_key, RecoveryKit};
use stacksnap::crypto::EncryptionKey;
use stacksnap::pipeline::{self, BackupOptions, ParallelConfig, RestoreOptions};
use stacksnap::runtime::DockerRuntime;
use stacksnap::{utils, verify};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Consistent, encrypted snapshots of compose stacks", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a compose stack to local disk or configured remote storage
    Backup {
        /// Project directory containing the compose manifest
        #[arg(short, long, conflicts_with = "project")]
        dir: Option<PathBuf>,

        /// Project name for label-based discovery (no directory required)
        #[arg(short, long)]
        project: Option<String>,

        /// Local output path (ignored with --remote)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pause application containers during the backup
        #[arg(long)]
        pause: bool,

        /// Take logical dumps of detected database containers
        #[arg(long)]
        include_db: bool,

        /// Snapshot each running container's filesystem as an image
        #[arg(long)]
        snapshot_images: bool,

        /// Upload to the storage backend configured via environment
        #[arg(long)]
        remote: bool,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Restore a stack from an archive
    Restore {
        /// Stack name the archive belongs to
        #[arg(short, long)]
        stack: String,

        /// Storage key (with --remote) or local archive path
        #[arg(short, long)]
        input: String,

        #[arg(long)]
        remote: bool,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Verify an archive structurally, or live with --live
    Verify {
        #[arg(short, long)]
        input: String,

        /// Stand the embedded manifest up as a disposable project
        #[arg(long)]
        live: bool,

        #[arg(long)]
        remote: bool,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// List an archive's members without touching the runtime
    Peek {
        #[arg(short, long)]
        input: String,

        #[arg(long)]
        remote: bool,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Generate a fresh 32-byte encryption key
    Keygen {
        /// Write the hex key to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Create or open a passphrase-wrapped recovery kit
    RecoveryKit {
        #[command(subcommand)]
        command: RecoveryKitCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RecoveryKitCommand {
    /// Wrap an existing key under a passphrase
    Create {
        /// File holding the hex-encoded key
        #[arg(long)]
        key_file: PathBuf,

        #[arg(long)]
        passphrase: String,

        /// Optional reminder stored in the kit
        #[arg(long)]
        hint: Option<String>,

        /// Output path for the kit
        #[arg(short, long, default_value = "recovery-kit.json")]
        out: PathBuf,
    },
    /// Recover the key from a kit
    Recover {
        #[arg(long)]
        kit: PathBuf,

        #[arg(long)]
        passphrase: String,
    },
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// Hex-encoded 32-byte encryption key
    #[arg(long, conflicts_with = "key_file")]
    key_hex: Option<String>,

    /// File holding the hex-encoded key
    #[arg(long)]
    key_file: Option<PathBuf>,
}

impl KeyArgs {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        let hex_key = match (&self.key_hex, &self.key_file) {
            (Some(hex_key), _) => hex_key.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read key file {}", path.display()))?,
            (None, None) => return Ok(None),
        };
        let key = EncryptionKey::from_hex(&hex_key)?;
        Ok(Some(key.as_bytes().to_vec()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env();
    config.init_logging(args.log_level.as_deref());

    // Ctrl+C propagates as cancellation to whatever operation is running.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT, cancelling...");
            signal_cancel.cancel();
        }
    });

    match args.command {
        Command::Backup {
            dir,
            project,
            output,
            pause,
            include_db,
            snapshot_images,
            remote,
            key,
        } => {
            if dir.is_none() && project.is_none() {
                bail!("either --dir or --project is required");
            }
            let runtime = Arc::new(DockerRuntime::connect()?);
            let provider = if remote {
                let provider = config.build_provider(&cancel).await?;
                if provider.is_none() {
                    bail!("--remote requires STACKSNAP_STORAGE to be configured");
                }
                provider
            } else {
                None
            };

            let result = pipeline::backup_stack(
                runtime,
                BackupOptions {
                    directory: dir,
                    project_name: project,
                    output_path: output,
                    pause_containers: pause,
                    include_databases: include_db,
                    snapshot_images,
                    provider,
                    encryption_key: key.load()?,
                    parallel: ParallelConfig::default(),
                    cancel: cancel.clone(),
                    logger: None,
                },
            )
            .await?;

            println!("Backup complete: {}", result.output_path);
            println!("  size:      {}", utils::fmt::format_bytes(result.size));
            println!(
                "  duration:  {}",
                utils::fmt::format_duration(result.duration.as_secs())
            );
            println!("  volumes:   {}", result.volumes_backed_up.join(", "));
            if !result.databases_dumped.is_empty() {
                println!("  databases: {}", result.databases_dumped.join(", "));
            }
            if result.paused_containers > 0 {
                println!("  paused:    {}", result.paused_containers);
            }
            println!("  encrypted: {}", result.encrypted);
        }

        Command::Restore {
            stack,
            input,
            remote,
            key,
        } => {
            let runtime = Arc::new(DockerRuntime::connect()?);
            let provider = if remote {
                config.build_provider(&cancel).await?
            } else {
                None
            };

            pipeline::restore_stack(
                runtime,
                RestoreOptions {
                    stack_name: stack.clone(),
                    input_path: input,
                    provider,
                    encryption_key: key.load()?,
                    cancel: cancel.clone(),
                    logger: None,
                },
            )
            .await?;

            println!("Restore of {stack} complete");
        }

        Command::Verify {
            input,
            live,
            remote,
            key,
        } => {
            let provider = if remote {
                config.build_provider(&cancel).await?
            } else {
                None
            };

            if live {
                let runtime = Arc::new(DockerRuntime::connect()?);
                let report =
                    verify::verify_live(runtime, provider, key.load()?, &input, cancel.clone())
                        .await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.verified {
                    std::process::exit(1);
                }
            } else {
                let report = verify::verify_archive(provider, key.load()?, &input).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.verified {
                    std::process::exit(1);
                }
            }
        }

        Command::Peek {
            input,
            remote,
            key,
        } => {
            let provider = if remote {
                config.build_provider(&cancel).await?
            } else {
                None
            };

            let members = pipeline::peek_backup(RestoreOptions {
                stack_name: String::new(),
                input_path: input,
                provider,
                encryption_key: key.load()?,
                cancel: cancel.clone(),
                logger: None,
            })
            .await?;

            for member in members {
                println!("{member}");
            }
        }

        Command::Keygen { out } => {
            let key = EncryptionKey::generate();
            match out {
                Some(path) => {
                    std::fs::write(&path, key.to_hex())?;
                    println!("Key written to {}", path.display());
                }
                None => println!("{}", key.to_hex()),
            }
        }

        Command::RecoveryKit { command } => match command {
            RecoveryKitCommand::Create {
                key_file,
                passphrase,
                hint,
                out,
            } => {
                let hex_key = std::fs::read_to_string(&key_file)?;
                let key = EncryptionKey::from_hex(&hex_key)?;
                let kit = create_recovery_kit(&key, &passphrase, hint.as_deref())?;
                std::fs::write(&out, serde_json::to_vec_pretty(&kit)?)?;
                println!("Recovery kit written to {}", out.display());
            }
            RecoveryKitCommand::Recover { kit, passphrase } => {
                let kit: RecoveryKit = serde_json::from_slice(&std::fs::read(&kit)?)?;
                let key = recover_key(&kit, &passphrase)?;
                println!("{}", key.to_hex());
            }
        },
    }

    Ok(())
}
