use std::io::{Cursor, Read};

use axum::{
    body::Bytes,
    extract::{Multipart, Path, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use data_model::{EdgeConfigId, EdgeConfigStateKind, EdgeConfiguration, EdgeError};
use state_store::{
    requests::{
        CreateEdgeConfigurationRequest,
        EdgeConfigTransitionRequest,
        RequestPayload,
        UpdateEdgeConfigurationRequest,
    },
    state_machine::EdgeObjectsColumns,
};
use tracing::info;

use super::{routes_state::RouteState, MAX_UPLOAD_BYTES};
use crate::{
    http_objects::{
        ConfigFile,
        CreatedResponse,
        EdgeAPIError,
        EdgeConfigFilesResponse,
        EdgeConfigMetadata,
        EdgeConfigUpload,
        EdgeConfigurationList,
        EdgeConfigurationResponse,
    },
    middleware::EdgeHeaders,
};

const UPLOAD_NONCE_LENGTH: usize = 8;

struct ConfigUpload {
    metadata: EdgeConfigMetadata,
    files: Vec<(String, Bytes)>,
}

async fn read_upload(mut multipart: Multipart) -> Result<ConfigUpload, EdgeAPIError> {
    let mut metadata: Option<EdgeConfigMetadata> = None;
    let mut archive: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EdgeAPIError::bad_request(&e.to_string()))?
    {
        match field.name() {
            Some("metadata") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| EdgeAPIError::bad_request(&e.to_string()))?;
                metadata = Some(serde_json::from_str(&text)?);
            }
            Some("file") => {
                archive = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| EdgeAPIError::bad_request(&e.to_string()))?,
                );
            }
            _ => {}
        }
    }
    let metadata = metadata.ok_or_else(|| EdgeAPIError::bad_request("missing metadata part"))?;
    let archive = archive.ok_or_else(|| EdgeAPIError::bad_request("missing file part"))?;
    Ok(ConfigUpload {
        metadata,
        files: extract_archive(&archive, MAX_UPLOAD_BYTES as u64)?,
    })
}

/// Unpacks a zip archive into relative paths and contents. Directory entries
/// are dropped, entries escaping the archive root are rejected. Sizes declared
/// in the archive are not trusted, at most `max_bytes` are decompressed.
fn extract_archive(archive: &[u8], max_bytes: u64) -> Result<Vec<(String, Bytes)>, EdgeAPIError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| EdgeAPIError::bad_request(&format!("invalid zip archive: {}", e)))?;
    let mut files = Vec::new();
    let mut remaining = max_bytes;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| EdgeAPIError::bad_request(&format!("invalid zip entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }
        let path = entry
            .enclosed_name()
            .and_then(|path| path.to_str().map(|p| p.replace('\\', "/")))
            .ok_or_else(|| {
                EdgeAPIError::bad_request(&format!("unsafe path in archive: {}", entry.name()))
            })?;
        let mut content = Vec::new();
        (&mut entry)
            .take(remaining + 1)
            .read_to_end(&mut content)
            .map_err(|e| EdgeAPIError::bad_request(&format!("can't read {}: {}", path, e)))?;
        remaining = remaining
            .checked_sub(content.len() as u64)
            .ok_or_else(|| {
                EdgeAPIError::bad_request(&format!(
                    "archive expands beyond {} bytes",
                    max_bytes
                ))
            })?;
        files.push((path, Bytes::from(content)));
    }
    if files.is_empty() {
        return Err(EdgeAPIError::bad_request("archive contains no files"));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn new_upload_dir(id: EdgeConfigId, version: u32) -> String {
    EdgeConfiguration::upload_dir(id, version, &nanoid::nanoid!(UPLOAD_NONCE_LENGTH))
}

/// Writes the files under `dir`, which belongs to this upload alone.
async fn store_files(
    state: &RouteState,
    dir: &str,
    files: Vec<(String, Bytes)>,
) -> Result<Vec<String>, EdgeAPIError> {
    let mut paths = Vec::with_capacity(files.len());
    for (path, content) in files {
        let key = EdgeConfiguration::file_key(dir, &path);
        if let Err(err) = state.blob_storage.put(&key, content).await {
            state.delete_blobs(dir).await;
            return Err(EdgeAPIError::internal_error(err));
        }
        paths.push(path);
    }
    Ok(paths)
}

async fn read_files(
    state: &RouteState,
    dir: &str,
    paths: &[String],
) -> Result<Vec<ConfigFile>, EdgeAPIError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let content = state
            .blob_storage
            .read_bytes(&EdgeConfiguration::file_key(dir, path))
            .await
            .map_err(EdgeAPIError::internal_error)?;
        files.push(ConfigFile {
            path: path.clone(),
            content: STANDARD.encode(&content),
        });
    }
    Ok(files)
}

fn get_config(state: &RouteState, id: EdgeConfigId) -> Result<EdgeConfiguration, EdgeAPIError> {
    state
        .edge_state
        .reader()
        .get_edge_configuration(id)?
        .ok_or_else(|| EdgeAPIError::not_found(&format!("edge configuration {} not found", id)))
}

/// Create an edge configuration
#[utoipa::path(
    post,
    path = "/edge_configurations",
    tag = "edge_configurations",
    request_body(content_type = "multipart/form-data", content = inline(EdgeConfigUpload)),
    responses(
        (status = 200, description = "configuration created", body = CreatedResponse),
        (status = BAD_REQUEST, description = "invalid metadata or archive")
    ),
)]
pub async fn create_edge_configuration(
    State(state): State<RouteState>,
    multipart: Multipart,
) -> Result<Json<CreatedResponse>, EdgeAPIError> {
    let upload = read_upload(multipart).await?;
    let name = upload
        .metadata
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| EdgeAPIError::bad_request("configuration name is required"))?;

    let id = EdgeConfigId::new(state.edge_state.allocate_id(EdgeObjectsColumns::EdgeConfigurations)?);
    let files_dir = new_upload_dir(id, 1);
    let files = store_files(&state, &files_dir, upload.files).await?;
    let request = CreateEdgeConfigurationRequest {
        id,
        name,
        base_dir: upload.metadata.base_dir.clone().unwrap_or_default(),
        category: upload.metadata.category,
        edge_group_ids: upload.metadata.group_ids(),
        files,
        files_dir,
        created_by: upload.metadata.user.clone(),
    };
    if let Err(err) = state
        .write(RequestPayload::CreateEdgeConfiguration(request))
        .await
    {
        state.delete_blobs(&EdgeConfiguration::files_prefix(id)).await;
        return Err(err);
    }
    Ok(Json(CreatedResponse { id: id.get() }))
}

/// Replace the files and groups of an idle edge configuration
#[utoipa::path(
    put,
    path = "/edge_configurations/{id}",
    tag = "edge_configurations",
    request_body(content_type = "multipart/form-data", content = inline(EdgeConfigUpload)),
    params(("id" = u64, Path, description = "edge configuration id")),
    responses(
        (status = 200, description = "rollout of the new version started"),
        (status = BAD_REQUEST, description = "configuration is not idle or the upload is invalid"),
        (status = NOT_FOUND, description = "configuration not found")
    ),
)]
pub async fn update_edge_configuration(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    multipart: Multipart,
) -> Result<(), EdgeAPIError> {
    let id = EdgeConfigId::new(id);
    let config = get_config(&state, id)?;
    if config.state != EdgeConfigStateKind::Idle {
        return Err(anyhow::Error::from(EdgeError::InvalidState(format!(
            "edge configuration {} is {}, updates require idle",
            id, config.state
        )))
        .into());
    }
    let upload = read_upload(multipart).await?;

    let version = config.version + 1;
    let files_dir = new_upload_dir(id, version);
    let files = store_files(&state, &files_dir, upload.files).await?;
    let request = UpdateEdgeConfigurationRequest {
        id,
        category: upload.metadata.category,
        edge_group_ids: upload.metadata.group_ids(),
        version,
        files,
        files_dir: files_dir.clone(),
        updated_by: upload.metadata.user.clone(),
    };
    // Versions older than the replaced one are dropped by the write itself.
    if let Err(err) = state
        .write(RequestPayload::UpdateEdgeConfiguration(request))
        .await
    {
        state.delete_blobs(&files_dir).await;
        return Err(err);
    }
    info!(edge_config_id = %id, version, "stored new edge configuration version");
    Ok(())
}

/// Delete an edge configuration
#[utoipa::path(
    delete,
    path = "/edge_configurations/{id}",
    tag = "edge_configurations",
    params(("id" = u64, Path, description = "edge configuration id")),
    responses(
        (status = 200, description = "removal started"),
        (status = NOT_FOUND, description = "configuration not found")
    ),
)]
pub async fn delete_edge_configuration(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    state
        .write(RequestPayload::DeleteEdgeConfiguration(EdgeConfigId::new(id)))
        .await?;
    Ok(())
}

/// List edge configurations
#[utoipa::path(
    get,
    path = "/edge_configurations",
    tag = "edge_configurations",
    responses(
        (status = 200, description = "all edge configurations", body = EdgeConfigurationList),
    ),
)]
pub async fn list_edge_configurations(
    State(state): State<RouteState>,
) -> Result<Json<EdgeConfigurationList>, EdgeAPIError> {
    let edge_configurations = state
        .edge_state
        .reader()
        .list_edge_configurations()?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(EdgeConfigurationList {
        edge_configurations,
    }))
}

/// Get an edge configuration
#[utoipa::path(
    get,
    path = "/edge_configurations/{id}",
    tag = "edge_configurations",
    params(("id" = u64, Path, description = "edge configuration id")),
    responses(
        (status = 200, description = "the edge configuration", body = EdgeConfigurationResponse),
        (status = NOT_FOUND, description = "configuration not found")
    ),
)]
pub async fn get_edge_configuration(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<EdgeConfigurationResponse>, EdgeAPIError> {
    Ok(Json(get_config(&state, EdgeConfigId::new(id))?.into()))
}

/// Configuration files for an agent
#[utoipa::path(
    get,
    path = "/edge_configurations/{id}/files",
    tag = "edge",
    params(
        ("id" = u64, Path, description = "edge configuration id"),
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
    ),
    responses(
        (status = 200, description = "current and, while updating, previous files", body = EdgeConfigFilesResponse),
        (status = FORBIDDEN, description = "unknown or untrusted edge id"),
        (status = NOT_FOUND, description = "configuration not assigned to the endpoint")
    ),
)]
pub async fn get_edge_configuration_files(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    headers: EdgeHeaders,
) -> Result<Json<EdgeConfigFilesResponse>, EdgeAPIError> {
    let endpoint = state.agent_endpoint_by_edge_id(&headers).await?;
    let id = EdgeConfigId::new(id);
    let reader = state.edge_state.reader();
    let entry_state = reader
        .get_config_states(endpoint.id)?
        .states
        .get(&id)
        .copied()
        .ok_or_else(|| {
            EdgeAPIError::not_found(&format!(
                "edge configuration {} is not assigned to endpoint {}",
                id, endpoint.id
            ))
        })?;
    let config = get_config(&state, id)?;

    let files = read_files(&state, &config.current_files_dir(), &config.files).await?;
    let mut prev_files = Vec::new();
    if entry_state == EdgeConfigStateKind::Updating {
        if let Some(previous) = config.previous_files_dir() {
            let paths = state
                .blob_storage
                .list_keys(&previous)
                .await
                .map_err(EdgeAPIError::internal_error)?;
            prev_files = read_files(&state, &previous, &paths).await?;
        }
    }

    Ok(Json(EdgeConfigFilesResponse {
        id: id.get(),
        name: config.name,
        base_dir: config.base_dir,
        category: config.category,
        version: config.version,
        state: entry_state,
        files,
        prev_files,
    }))
}

/// Agent acknowledgement of a configuration state
#[utoipa::path(
    put,
    path = "/edge_configurations/{id}/{state}",
    tag = "edge",
    params(
        ("id" = u64, Path, description = "edge configuration id"),
        ("state" = String, Path, description = "state name or numeric code"),
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
    ),
    responses(
        (status = 200, description = "transition applied"),
        (status = BAD_REQUEST, description = "invalid state or transition"),
        (status = FORBIDDEN, description = "unknown or untrusted edge id")
    ),
)]
pub async fn transition_edge_configuration(
    Path((id, raw_state)): Path<(u64, String)>,
    State(state): State<RouteState>,
    headers: EdgeHeaders,
) -> Result<(), EdgeAPIError> {
    let next = raw_state
        .parse::<EdgeConfigStateKind>()
        .map_err(|e| EdgeAPIError::bad_request(&e.to_string()))?;
    let endpoint = state.agent_endpoint_by_edge_id(&headers).await?;
    state
        .write(RequestPayload::EdgeConfigurationTransition(
            EdgeConfigTransitionRequest {
                config_id: EdgeConfigId::new(id),
                endpoint_id: endpoint.id,
                state: next,
            },
        ))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap();
                continue;
            }
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_archive() {
        let bytes = archive(&[
            ("nginx/", ""),
            ("nginx/site.conf", "server {}"),
            ("app.env", "MODE=edge"),
        ]);
        let files = extract_archive(&bytes, 1024).unwrap();
        let paths: Vec<&str> = files.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["app.env", "nginx/site.conf"]);
        assert_eq!(files[1].1.as_ref(), b"server {}");
    }

    #[test]
    fn test_extract_archive_rejects_bad_input() {
        assert!(extract_archive(b"not a zip", 1024).is_err());
        assert!(extract_archive(&archive(&[("empty/", "")]), 1024).is_err());
        assert!(extract_archive(&archive(&[("../escape.conf", "x")]), 1024).is_err());
    }

    #[test]
    fn test_extract_archive_caps_expanded_size() {
        // Compresses to a few hundred bytes.
        let zeros = "0".repeat(1024 * 1024);
        let bytes = archive(&[("big.bin", zeros.as_str())]);
        assert!(bytes.len() < 64 * 1024);
        assert!(extract_archive(&bytes, 64 * 1024).is_err());

        // The cap covers the archive as a whole, not each entry.
        let bytes = archive(&[("a.conf", "12345"), ("b.conf", "67890")]);
        assert!(extract_archive(&bytes, 10).is_ok());
        assert!(extract_archive(&bytes, 9).is_err());
    }
}
