//! cloudfiles - command line client for cloud file storage
//!
//! Every command builds a file manager over the persistent local store, so
//! operations queued with `--offline` survive until a later `sync`.

mod args;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudfiles::api::{
    format_bytes, FileRecord, FileUpdate, HttpFileApi, ListQuery, ShareRequest, UploadRequest,
};
use cloudfiles::cache::{FileCache, JsonFileStore};
use cloudfiles::files::{FileManager, MoveOptions, Outcome};
use cloudfiles::{ClientConfig, Connectivity};

use args::{sort_order, Cli, Commands};

/// Page size used to bring a file into local state before mutating it
const LOOKUP_PAGE_SIZE: u32 = 100;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ClientConfig::load_or_default(cli.config.as_deref())?;
    init_logging(&config.logging.level);

    let store = JsonFileStore::open(config.cache.store_path(), config.cache.store_max_bytes)
        .context("Failed to open local store")?;
    debug!(path = %store.path().display(), "Opened local store");
    let api = Arc::new(HttpFileApi::new(
        &config.api.base_url,
        config.api.auth_token.clone(),
        config.request_timeout(),
    )?);
    let file_cache = FileCache::with_config(
        config.cache.downloads_dir(),
        config.cache.file_cache_max_mb * 1024 * 1024,
    )?;
    debug!(dir = %file_cache.cache_dir().display(), "Download cache ready");

    let manager = FileManager::builder(api.clone(), Arc::new(store))
        .settings(config.manager_settings())
        .connectivity(Connectivity::new(!cli.offline))
        .file_cache(file_cache)
        .on_storage_update(|quota| {
            info!(
                used = %format_bytes(quota.used_bytes),
                limit = %format_bytes(quota.limit_bytes),
                percent = quota.percentage,
                "Storage updated"
            );
        })
        .build();

    let result = run(cli.command, &manager, &api).await;
    manager.shutdown();

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn run(command: Commands, manager: &FileManager, api: &HttpFileApi) -> Result<()> {
    match command {
        Commands::List {
            page,
            page_size,
            search,
            file_type,
            folder,
            deleted,
            sort_by,
            asc,
        } => {
            manager
                .load_files(ListQuery {
                    include_deleted: deleted,
                    page,
                    page_size,
                    sort_by,
                    sort_order: sort_order(asc),
                    search,
                    file_type,
                    folder_id: folder,
                })
                .await;
            if let Some(e) = manager.error("load_files") {
                bail!("{}", e.message);
            }
            print_listing(manager, deleted);
        }
        Commands::Upload {
            path,
            name,
            file_type,
            description,
            tags,
            folder,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let request = UploadRequest {
                content_type: content_type_for(&path).to_string(),
                file_name,
                bytes,
                display_name: name,
                file_type,
                description,
                tags,
                expires_at: None,
                folder_id: folder,
            };
            match manager.upload(request).await? {
                Outcome::Completed(record) => println!("Uploaded {} ({})", record.name, record.id),
                Outcome::Queued(id) => println!("Offline: upload queued as {}", id),
            }
        }
        Commands::Edit {
            id,
            name,
            file_type,
            description,
        } => {
            let update = FileUpdate {
                name,
                file_type,
                description,
                ..FileUpdate::default()
            };
            if update.is_empty() {
                bail!("Nothing to change");
            }
            lookup(manager, &id).await?;
            report(manager.edit_file(&id, update, false).await?, "Updated", &id);
        }
        Commands::Star { id } => {
            lookup(manager, &id).await?;
            match manager.toggle_star(&id).await? {
                Outcome::Completed(starred) => {
                    println!("{} {}", if starred { "Starred" } else { "Unstarred" }, id)
                }
                Outcome::Queued(op) => println!("Offline: change queued as {}", op),
            }
        }
        Commands::Archive { id } => {
            lookup(manager, &id).await?;
            match manager.toggle_archive(&id).await? {
                Outcome::Completed(archived) => {
                    println!("{} {}", if archived { "Archived" } else { "Unarchived" }, id)
                }
                Outcome::Queued(op) => println!("Offline: change queued as {}", op),
            }
        }
        Commands::Delete { id, show_deleted } => {
            lookup(manager, &id).await?;
            report(manager.delete_file(&id, show_deleted).await?, "Deleted", &id);
        }
        Commands::Restore { ids } => {
            if let [id] = ids.as_slice() {
                lookup(manager, id).await?;
                manager.restore_file(id).await?;
                println!("Restored {}", id);
            } else {
                let restored = manager.bulk_restore(&ids).await?;
                println!("Restored {} of {} files", restored, ids.len());
            }
        }
        Commands::Purge { id } => {
            lookup(manager, &id).await?;
            manager.permanently_delete_file(&id).await?;
            println!("Permanently deleted {}", id);
        }
        Commands::BulkDelete { ids } => {
            prime(manager).await;
            let results = manager.bulk_delete(&ids).await;
            let mut failures = 0;
            for result in &results {
                if result.success {
                    println!("Deleted {}", result.file_id);
                } else {
                    failures += 1;
                    println!(
                        "Failed {}: {}",
                        result.file_id,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if failures > 0 {
                bail!("{} of {} deletions failed", failures, results.len());
            }
        }
        Commands::Move { id, folder } => {
            let options = MoveOptions {
                on_moved: Some(Box::new(|record: &FileRecord| -> anyhow::Result<()> {
                    println!(
                        "Moved {} to {}",
                        record.name,
                        record.folder_id.as_deref().unwrap_or("root")
                    );
                    Ok(())
                })),
                ..MoveOptions::default()
            };
            lookup(manager, &id).await?;
            if let Outcome::Queued(op) = manager.move_file(&id, folder.as_deref(), options).await? {
                println!("Offline: move queued as {}", op);
            }
        }
        Commands::Download { id, format, out } => {
            if manager.is_online() {
                lookup(manager, &id).await?;
            }
            let path = manager.download(&id, format.map(Into::into), &out).await?;
            println!("Saved {}", path.display());
        }
        Commands::Duplicate { id } => {
            let copy = manager.duplicate(&id).await?;
            println!("Created {} ({})", copy.name, copy.id);
        }
        Commands::Share {
            id,
            email,
            permission,
        } => {
            let share = ShareRequest {
                user_email: email.clone(),
                permission: permission.into(),
                expires_at: None,
            };
            report(manager.share(&id, share).await?, "Shared with", &email);
        }
        Commands::Stats { id } => {
            let stats = manager.file_stats(&id).await?;
            println!("Downloads: {}", stats.download_count);
            println!("Views:     {}", stats.view_count);
            println!("Shares:    {}", stats.share_count);
            if let Some(at) = stats.last_accessed_at {
                println!("Last seen: {}", at.format("%Y-%m-%d %H:%M"));
            }
        }
        Commands::Activity { id } => {
            let entries = manager.file_activity(&id).await?;
            if entries.is_empty() {
                println!("No activity recorded.");
            }
            for entry in entries {
                println!(
                    "{}  {:<12} {}",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.action,
                    entry.user_id.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Queue => {
            let pending = manager.queue().pending();
            if pending.is_empty() {
                println!("Offline queue is empty.");
            } else {
                println!("Queued operations:");
                for op in pending {
                    println!(
                        "  {} {:<7} retries={} queued {}",
                        op.id,
                        op.kind,
                        op.retries,
                        op.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        Commands::Sync => {
            if !manager.is_online() {
                bail!("Cannot sync while offline");
            }
            let report = manager.sync().await;
            for failed in &report.failed {
                warn!(operation_id = %failed.operation.id, error = %failed.error, "Dropped queued operation");
            }
            println!(
                "Synced {} operations, {} dropped, {} still queued",
                report.completed.len(),
                report.failed.len(),
                report.remaining
            );
        }
        Commands::Status => {
            println!("Connection: {}", api.health_status());
            println!("Queued operations: {}", manager.queue().len());
            let (hits, misses, hit_rate) = manager.cache_stats();
            println!(
                "List cache: {} hits, {} misses ({:.1}% hit rate)",
                hits, misses, hit_rate
            );
            let errors = api.recent_errors();
            if !errors.is_empty() {
                println!("Recent errors:");
                for entry in errors {
                    println!(
                        "  [{}] {} {}: {}",
                        entry.timestamp, entry.operation, entry.path, entry.error
                    );
                }
            }
        }
    }

    Ok(())
}

/// Load the first page including deleted files so id based commands can see
/// the record they act on
async fn prime(manager: &FileManager) {
    manager
        .load_files(ListQuery {
            include_deleted: true,
            page_size: LOOKUP_PAGE_SIZE,
            ..ListQuery::default()
        })
        .await;
}

async fn lookup(manager: &FileManager, file_id: &str) -> Result<FileRecord> {
    if manager.file(file_id).is_none() {
        prime(manager).await;
    }
    match manager.file(file_id) {
        Some(record) => Ok(record),
        None => bail!("File not found: {}", file_id),
    }
}

fn report(outcome: Outcome<()>, verb: &str, subject: &str) {
    match outcome {
        Outcome::Completed(()) => println!("{} {}", verb, subject),
        Outcome::Queued(op) => println!("Offline: operation queued as {}", op),
    }
}

fn print_listing(manager: &FileManager, show_deleted: bool) {
    let files = manager.visible_files(show_deleted);
    if files.is_empty() {
        println!("No files.");
        return;
    }

    for file in &files {
        let mut flags = String::new();
        if file.is_starred {
            flags.push('*');
        }
        if file.is_archived {
            flags.push('A');
        }
        if file.is_deleted() {
            flags.push('D');
        }
        println!(
            "{:<3} {:<24} {:>10}  {}  {}",
            flags,
            file.id,
            file.size_label,
            file.last_modified.format("%Y-%m-%d"),
            file.name
        );
    }

    let pagination = manager.pagination();
    println!(
        "Page {} of {} ({} files, {} active on this page)",
        pagination.page,
        pagination.total_pages.max(1),
        pagination.total,
        format_bytes(manager.active_bytes())
    );
    if let Some(quota) = manager.quota() {
        println!(
            "Storage: {:.2} GB of {:.2} GB used ({:.1}%)",
            quota.used_gb(),
            quota.limit_gb(),
            quota.percentage
        );
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
