use std::collections::HashSet;
use std::sync::Arc;
use anyhow::{Context, bail};
use futures_util::future::try_join_all;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use pdh_upload::config::DEFAULT_CONFIG_FILE;
use pdh_upload::utils::{format_bytes, format_percent};
use pdh_upload::{Category, Config, ResumableClient, TaskStatus, UploadEvent, UploadFile, UploadManager};

const USAGE: &str = "usage: pdh-upload [config.toml] <image|video|document|script> <file>...";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match args.first() {
        Some(first) if first.ends_with(".toml") => args.remove(0),
        _ => DEFAULT_CONFIG_FILE.to_string(),
    };
    if args.len() < 2 {
        bail!(USAGE);
    }

    let category: Category = args[0].parse().context(USAGE)?;
    let paths = &args[1..];

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path))?;
    let client = ResumableClient::from_config(&config)?;
    tracing::info!(server = %config.server_url, %category, files = paths.len(), "starting upload");

    let files = try_join_all(paths.iter().map(UploadFile::from_path))
        .await
        .context("Failed to read input files")?;

    let handle = UploadManager::builder(Arc::new(client))
        .config(config.upload_config())
        .spawn();
    let manager = handle.manager.clone();

    // 先订阅再入队，避免漏掉事件
    let mut events = manager.subscribe_events();
    let task_ids = manager.enqueue_files(files, category).await?;
    let mut pending: HashSet<_> = task_ids.iter().copied().collect();
    let mut attachments = Vec::new();
    let mut failed = 0;

    while !pending.is_empty() {
        match events.recv().await {
            Ok(UploadEvent::TaskUpdated { task }) if pending.contains(&task.id) => {
                println!(
                    "{:<32} {:>9} {:>12} / {:<12} {}",
                    task.name,
                    format!("{:?}", task.status).to_lowercase(),
                    format_bytes(task.bytes_sent),
                    format_bytes(task.size),
                    format_percent(task.progress()),
                );

                match task.status {
                    TaskStatus::Done | TaskStatus::Canceled => {
                        pending.remove(&task.id);
                    }
                    TaskStatus::Failed => {
                        eprintln!("{}: {}", task.name, task.error.as_deref().unwrap_or("unknown error"));
                        failed += 1;
                        pending.remove(&task.id);
                    }
                    _ => {}
                }
            }
            Ok(UploadEvent::Uploaded { attachment, .. }) => {
                println!("attach://{}", attachment.id);
                attachments.push(attachment);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress events lagged");
                // 可能错过了终态事件，直接查一次快照
                for task in manager.tasks().await? {
                    if !pending.contains(&task.id) {
                        continue;
                    }
                    match task.status {
                        TaskStatus::Done | TaskStatus::Canceled => {
                            pending.remove(&task.id);
                        }
                        TaskStatus::Failed => {
                            failed += 1;
                            pending.remove(&task.id);
                        }
                        _ => {}
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    drop(manager);
    handle.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&attachments)?);
    if failed > 0 {
        bail!("{} of {} upload(s) failed", failed, task_ids.len());
    }

    Ok(())
}
