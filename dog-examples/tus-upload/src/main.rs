use std::sync::Arc;

use anyhow::{Context, Result};
use dog_tus::{FileUploadStore, ResumableUpload, StringMap, TusConfig, UploadSession};
use tokio::sync::mpsc;
use tracing::{error, info};

enum Outcome {
    Done(String),
    Failed(String),
}

fn watch(upload: &ResumableUpload, outcomes: &mpsc::UnboundedSender<Outcome>) {
    let id = upload.id().clone();
    upload.on_progress(move |sent, total| {
        info!(upload_id = %id, "{}/{} bytes ({:.1}%)", sent, total, sent as f64 * 100.0 / total.max(1) as f64);
    });

    let tx = outcomes.clone();
    upload.on_result(move |url| {
        let _ = tx.send(Outcome::Done(url.to_string()));
    });
    let tx = outcomes.clone();
    upload.on_failure(move |e| {
        let _ = tx.send(Outcome::Failed(e.to_string()));
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = TusConfig::from_env().context("set DOG_TUS_ENDPOINT to the tus creation URL")?;
    let store_path = std::env::var("DOG_TUS_STORE").unwrap_or_else(|_| "tus-uploads.json".to_string());
    let store = Arc::new(FileUploadStore::open(&store_path).await?);
    let session = UploadSession::with_http(config, store)?;

    if let Ok(info) = session.server_info().await {
        info!(version = %info.version, extensions = ?info.extensions, "Connected to tus server");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();

    // Anything the previous run left behind goes first
    for upload in session.restore_all_uploads().await? {
        let offset = upload.offset().await;
        info!(upload_id = %upload.id(), offset, "Found unfinished upload");
        watch(&upload, &tx);
    }

    for path in std::env::args().skip(1) {
        let upload = session
            .create_from_file(&path, StringMap::new(), StringMap::new())
            .await
            .with_context(|| format!("cannot upload {}", path))?;
        watch(&upload, &tx);
    }

    let mut pending = session.resume_all().await.len();
    if pending == 0 {
        println!("usage: tus-upload <file>...");
        return Ok(());
    }

    let mut failed = 0;
    while pending > 0 {
        match rx.recv().await {
            Some(Outcome::Done(url)) => println!("[tus] uploaded {}", url),
            Some(Outcome::Failed(e)) => {
                error!(error = %e, "Upload failed; it will be retried on the next run");
                failed += 1;
            }
            None => break,
        }
        pending -= 1;
    }

    if failed > 0 {
        anyhow::bail!("{} upload(s) failed", failed);
    }
    Ok(())
}
