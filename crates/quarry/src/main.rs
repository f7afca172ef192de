//! Admin command line for the Quarry processing core.
//!
//! Runs the controller operations against a local deployment rooted in the
//! configured directories. The invoking user is treated as a local admin;
//! real deployments front these operations with the HTTP service and its
//! user directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quarry_processing::{
    ExportTarget, NoCentralDeployment, NoopNotifier, ProcessingContext, UploadController,
    UploadMetadataUpdate, WorkerPool,
};
use quarry_protocol::{
    MemoryUserDirectory, QuarryConfig, QuarryError, RawPath, UploadId, User,
};
use quarry_search::MemorySearchIndex;
use quarry_state::{UploadOrder, UploadQuery};

const WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "quarry", version, about = "Quarry upload processing admin tool")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "quarry.toml")]
    config: PathBuf,

    /// Acting user id
    #[arg(long, global = true, default_value = "admin")]
    user: String,

    /// Verbose console logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Create a new upload
    Create {
        #[arg(long)]
        name: Option<String>,
        /// Publish as soon as the initial processing succeeds
        #[arg(long)]
        publish_directly: bool,
        /// Embargo period in months (0-36)
        #[arg(long)]
        embargo: Option<u32>,
    },
    /// Add raw files (plain file, directory, zip or tar) and process
    Add {
        upload_id: UploadId,
        source: PathBuf,
        /// Target directory inside the raw tree
        #[arg(long, default_value = "")]
        target_dir: String,
        /// Remove the source when done
        #[arg(long)]
        temporary: bool,
    },
    /// Delete a raw path (empty path empties the raw tree) and process
    Rm {
        upload_id: UploadId,
        #[arg(default_value = "")]
        path: String,
    },
    /// Re-match, re-parse and re-normalize an upload
    Reprocess { upload_id: UploadId },
    /// Pack the upload into the public area
    Publish {
        upload_id: UploadId,
        /// Embargo period in months (0-36)
        #[arg(long)]
        embargo: Option<u32>,
    },
    /// Lift the embargo of a published upload
    LiftEmbargo { upload_id: UploadId },
    /// Rename an upload
    SetName {
        upload_id: UploadId,
        name: String,
    },
    /// Force-fail a wedged process so the upload does not stay stuck
    Kill { upload_id: UploadId },
    /// Delete an upload with all its files and entries
    Delete { upload_id: UploadId },
    /// List uploads
    Ls {
        /// Order by publish time instead of create time
        #[arg(long)]
        by_publish_time: bool,
    },
    /// Show one upload and its entries
    Show { upload_id: UploadId },
    /// Export an upload as a bundle
    Export {
        upload_id: UploadId,
        target: PathBuf,
        /// Write an uncompressed directory instead of a zip
        #[arg(long)]
        uncompressed: bool,
        /// Move files instead of copying (uncompressed only)
        #[arg(long)]
        move_files: bool,
    },
    /// Import an upload bundle (zip or directory)
    Import { bundle: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.is_file() {
        QuarryConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config: {}", cli.config.display()))?
    } else {
        QuarryConfig::default()
    };

    if let Commands::Init = cli.command {
        config
            .save(&cli.config)
            .with_context(|| format!("Failed to write config: {}", cli.config.display()))?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    quarry_logging::init_logging(quarry_logging::LogConfig {
        app_name: "quarry",
        log_dir: config.fs.tmp_root.join("logs"),
        verbose: cli.verbose,
    })?;

    let users = Arc::new(MemoryUserDirectory::with_users([User::admin(
        cli.user.clone(),
        cli.user.clone(),
    )]));
    let ctx = Arc::new(ProcessingContext::new(
        config,
        Arc::new(MemorySearchIndex::new()),
        users,
        Arc::new(NoopNotifier),
        Arc::new(NoCentralDeployment),
    )?);
    let controller = UploadController::new(ctx.clone());
    let pool = WorkerPool::start(ctx.clone(), ctx.config.process.workers);
    quarry_processing::resurrect_pending(&ctx)?;

    let result = run(&cli, &controller);
    pool.shutdown();

    // Rejected requests are the caller's to fix; report them without the
    // error chain and with their own exit code.
    if let Err(err) = &result {
        if let Some(rejection) = err.downcast_ref::<QuarryError>() {
            if rejection.is_client_error() {
                eprintln!("request rejected: {rejection}");
                std::process::exit(2);
            }
        }
    }
    result
}

fn run(cli: &Cli, controller: &UploadController) -> Result<()> {
    let user = cli.user.as_str();
    match &cli.command {
        Commands::Init => unreachable!("handled before startup"),
        Commands::Create {
            name,
            publish_directly,
            embargo,
        } => {
            let upload = controller.create(user, name.clone(), *publish_directly, *embargo)?;
            println!("{}", upload.upload_id);
        }
        Commands::Add {
            upload_id,
            source,
            target_dir,
            temporary,
        } => {
            let target_dir = RawPath::new(target_dir.clone())?;
            controller.add_files(upload_id, user, source, target_dir, *temporary)?;
            let upload = controller.wait_for(upload_id, WAIT_TIMEOUT)?;
            print_status(controller, &upload)?;
        }
        Commands::Rm { upload_id, path } => {
            let path = RawPath::new(path.clone())?;
            controller.delete_files(upload_id, user, path)?;
            let upload = controller.wait_for(upload_id, WAIT_TIMEOUT)?;
            print_status(controller, &upload)?;
        }
        Commands::Reprocess { upload_id } => {
            controller.reprocess(upload_id, user)?;
            let upload = controller.wait_for(upload_id, WAIT_TIMEOUT)?;
            print_status(controller, &upload)?;
        }
        Commands::Publish { upload_id, embargo } => {
            controller.publish(upload_id, user, *embargo)?;
            println!("published {upload_id}");
        }
        Commands::LiftEmbargo { upload_id } => {
            controller.lift_embargo(upload_id, user)?;
            println!("lifted embargo of {upload_id}");
        }
        Commands::SetName { upload_id, name } => {
            controller.set_upload_metadata(
                upload_id,
                user,
                UploadMetadataUpdate {
                    upload_name: Some(name.clone()),
                    ..UploadMetadataUpdate::default()
                },
            )?;
        }
        Commands::Kill { upload_id } => {
            controller.force_fail(upload_id, user)?;
            println!("killed running process of {upload_id}");
        }
        Commands::Delete { upload_id } => {
            controller.delete(upload_id, user)?;
            println!("deleted {upload_id}");
        }
        Commands::Ls { by_publish_time } => {
            let order = if *by_publish_time {
                UploadOrder::PublishTime
            } else {
                UploadOrder::CreateTime
            };
            let mut page_after = None;
            loop {
                let page = controller.context().store.list_uploads(&UploadQuery {
                    order,
                    page_after: page_after.clone(),
                    page_size: 50,
                    ..UploadQuery::default()
                })?;
                for upload in &page.uploads {
                    println!(
                        "{}  {:<20} {:<10} {}",
                        upload.upload_id,
                        upload.upload_name.as_deref().unwrap_or("-"),
                        upload.process_status,
                        if upload.published() {
                            "published"
                        } else {
                            "staging"
                        },
                    );
                }
                match page.next_page_after {
                    Some(key) => page_after = Some(key),
                    None => break,
                }
            }
        }
        Commands::Show { upload_id } => {
            let upload = controller.get_upload(upload_id)?;
            println!("{}", serde_json::to_string_pretty(&upload)?);
            for entry in controller.get_entries(upload_id)? {
                println!(
                    "{}  {:<10} {:<20} {}",
                    entry.entry_id, entry.process_status, entry.parser_name, entry.mainfile,
                );
            }
        }
        Commands::Export {
            upload_id,
            target,
            uncompressed,
            move_files,
        } => {
            if *move_files && !*uncompressed {
                anyhow::bail!("--move-files requires --uncompressed");
            }
            let export_target = if *uncompressed {
                ExportTarget::Dir {
                    path: target.clone(),
                    move_files: *move_files,
                }
            } else {
                ExportTarget::Zip(target.clone())
            };
            controller.export_bundle(upload_id, user, Default::default(), export_target)?;
            println!("exported {} to {}", upload_id, target.display());
        }
        Commands::Import { bundle } => {
            let upload = controller.import_bundle(bundle, user)?;
            println!("imported {}", upload.upload_id);
        }
    }
    Ok(())
}

fn print_status(controller: &UploadController, upload: &quarry_protocol::UploadRecord) -> Result<()> {
    let entries = controller.get_entries(&upload.upload_id)?;
    let failed = entries
        .iter()
        .filter(|entry| entry.process_status == quarry_protocol::ProcessStatus::Failure)
        .count();
    println!(
        "{}: {} ({} entries, {} failed)",
        upload.upload_id,
        upload.process_status,
        entries.len(),
        failed,
    );
    for error in &upload.errors {
        eprintln!("error: {error}");
    }
    Ok(())
}
