//! Route handlers.

use crate::error::RelayError;
use crate::pipeline::serve;
use crate::pipeline::upload::UploadedFile;
use crate::run::{sanitize_file_name, RunId, RunLayout};
use crate::server::{AppState, RUN_ID_HEADER};
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Multipart field names accepted as files.
const FILE_FIELDS: [&str; 2] = ["files[]", "files"];

/// `POST /process-multiple`
pub async fn process_multiple(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, RelayError> {
    let layout = state.relay.layout(RunId::new());
    let max_files = state.relay.config().max_files;

    let files = match receive_files(&layout, max_files, &mut multipart).await {
        Ok(files) => files,
        Err(e) => {
            info!(run = %layout.run, "Rejected upload: {}", e);
            serve::clear_dir(&layout.upload_dir).await;
            return Err(e);
        }
    };

    let manifest = state.relay.process_batch(&layout, &files).await?;
    Ok(([(RUN_ID_HEADER, layout.run.to_string())], Json(manifest)).into_response())
}

/// Stream every file part into the run's upload dir.
async fn receive_files(
    layout: &RunLayout,
    max_files: usize,
    multipart: &mut Multipart,
) -> Result<Vec<UploadedFile>, RelayError> {
    tokio::fs::create_dir_all(&layout.upload_dir)
        .await
        .map_err(|e| RelayError::fs(&layout.upload_dir, e))?;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::InvalidUpload(e.body_text()))?
    {
        if !field.name().is_some_and(|n| FILE_FIELDS.contains(&n)) {
            continue;
        }
        if files.len() >= max_files {
            return Err(RelayError::InvalidUpload(format!(
                "at most {max_files} files per request"
            )));
        }
        let name = field
            .file_name()
            .and_then(sanitize_file_name)
            .ok_or_else(|| RelayError::InvalidUpload("file part without a usable name".into()))?;
        files.push(write_field(layout, name, field).await?);
    }
    Ok(files)
}

async fn write_field(
    layout: &RunLayout,
    name: String,
    mut field: Field<'_>,
) -> Result<UploadedFile, RelayError> {
    let path = layout.upload_dir.join(layout.local_upload_name(&name));
    let mut out = tokio::fs::File::create(&path)
        .await
        .map_err(|e| RelayError::fs(&path, e))?;

    let mut size = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| RelayError::InvalidUpload(e.body_text()))?
    {
        out.write_all(&chunk)
            .await
            .map_err(|e| RelayError::fs(&path, e))?;
        size += chunk.len() as u64;
    }
    out.flush().await.map_err(|e| RelayError::fs(&path, e))?;

    Ok(UploadedFile { name, size, path })
}

#[derive(Debug, Deserialize)]
pub struct ProcessedQuery {
    pub run: Option<String>,
}

/// `GET /processed?run=<id>`
pub async fn processed(
    State(state): State<AppState>,
    Query(query): Query<ProcessedQuery>,
) -> Result<Response, RelayError> {
    let run: RunId = query
        .run
        .as_deref()
        .ok_or_else(|| RelayError::UnknownRun("<missing>".into()))?
        .parse()?;

    match state.relay.take_processed(run).await {
        Ok(files) => Ok(Json(files).into_response()),
        Err(e) => {
            error!(run = %run, "Error reading processed files: {}", e);
            Err(e)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Healthz {
    status: &'static str,
}

/// `GET /healthz`
pub async fn healthz() -> Json<Healthz> {
    Json(Healthz { status: "ok" })
}
