use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap},
    Json,
};
use futures::{StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Deserialize};

use super::{ApiError, ApiResult, AppState, HealthResponse};
use crate::{
    catalog::{AssetKind, FileEntry},
    error::ServiceError,
    inventory::{Image, ImageQuery, IsoSource},
    upload::UploadStream,
};

const JSON_BODY_LIMIT: usize = 64 * 1024;

/// Parameters of `PUT /images`, from the query string or a JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageParams {
    pub name: Option<String>,
    pub version: Option<String>,
    pub isostore: Option<String>,
    pub isolocal: Option<String>,
    pub isoweb: Option<String>,
    pub isoclient: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

impl ImageParams {
    /// Fill fields missing here from `other`.
    pub fn or(self, other: ImageParams) -> ImageParams {
        ImageParams {
            name: non_empty(self.name).or(non_empty(other.name)),
            version: non_empty(self.version).or(non_empty(other.version)),
            isostore: non_empty(self.isostore).or(non_empty(other.isostore)),
            isolocal: non_empty(self.isolocal).or(non_empty(other.isolocal)),
            isoweb: non_empty(self.isoweb).or(non_empty(other.isoweb)),
            isoclient: non_empty(self.isoclient).or(non_empty(other.isoclient)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct NameParam {
    name: Option<String>,
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// Parse a JSON body if one was sent, else the default value.
async fn json_body<T: DeserializeOwned + Default>(
    headers: &HeaderMap,
    body: Body,
) -> Result<T, ApiError> {
    if !is_json(headers) {
        return Ok(T::default());
    }
    let bytes = axum::body::to_bytes(body, JSON_BODY_LIMIT)
        .await
        .map_err(|_| ServiceError::bad_request("Invalid request body"))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| ServiceError::bad_request(format!("Invalid request body: {e}")).into())
}

fn upload_stream(body: Body) -> UploadStream {
    body.into_data_stream().map_err(std::io::Error::other).boxed()
}

fn required(value: Option<String>, what: &str) -> Result<String, ApiError> {
    non_empty(value).ok_or_else(|| ServiceError::bad_request(format!("{what} is required")).into())
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub(super) async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<Vec<Image>> {
    Ok(Json(state.inventory.find_images_by_query(&query).await?))
}

pub(super) async fn add_image(
    State(state): State<AppState>,
    Query(query): Query<ImageParams>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Image> {
    // With isoclient the body carries the ISO itself.
    let (params, body) = if non_empty(query.isoclient.clone()).is_some() {
        (query.or(ImageParams::default()), Some(body))
    } else {
        let from_body: ImageParams = json_body(&headers, body).await?;
        (query.or(from_body), None)
    };

    let name = required(params.name, "OS name")?;
    let version = required(params.version, "OS version")?;

    let source = match (params.isoclient, body) {
        (Some(iso), Some(body)) => IsoSource::Client {
            iso,
            body: upload_stream(body),
        },
        (Some(_), None) => {
            return Err(ServiceError::bad_request(
                "isoclient must be given in the query string",
            )
            .into())
        }
        (None, _) => match (params.isolocal, params.isoweb, params.isostore) {
            (Some(local), _, _) => IsoSource::Local(PathBuf::from(local)),
            (None, Some(url), _) => IsoSource::Web(url),
            (None, None, Some(iso)) => IsoSource::Store(iso),
            (None, None, None) => {
                return Err(ServiceError::bad_request(
                    "At least one iso source should be specified: isostore, isolocal, isoweb, isoclient",
                )
                .into())
            }
        },
    };

    let image = state
        .inventory
        .add_image_from_source(&name, &version, source)
        .await?;
    Ok(Json(image))
}

pub(super) async fn delete_images(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<Vec<Image>> {
    if query.is_empty() {
        return Err(ServiceError::bad_request("An image query is required").into());
    }
    Ok(Json(state.inventory.delete_image_by_query(&query).await?))
}

pub(super) async fn list_iso(State(state): State<AppState>) -> ApiResult<Vec<FileEntry>> {
    Ok(Json(state.catalog.get_all_iso().await?))
}

pub(super) async fn list_microkernel(State(state): State<AppState>) -> ApiResult<Vec<FileEntry>> {
    Ok(Json(state.catalog.get_all_microkernel().await?))
}

async fn upload(
    state: AppState,
    kind: AssetKind,
    query: NameParam,
    body: Body,
) -> ApiResult<FileEntry> {
    let name = required(query.name, "name")?;
    let entry = state
        .catalog
        .upload(kind, &name, upload_stream(body))
        .await?;
    Ok(Json(entry))
}

pub(super) async fn upload_iso(
    State(state): State<AppState>,
    Query(query): Query<NameParam>,
    body: Body,
) -> ApiResult<FileEntry> {
    upload(state, AssetKind::Iso, query, body).await
}

pub(super) async fn upload_microkernel(
    State(state): State<AppState>,
    Query(query): Query<NameParam>,
    body: Body,
) -> ApiResult<FileEntry> {
    upload(state, AssetKind::Microkernel, query, body).await
}

async fn delete(
    state: AppState,
    kind: AssetKind,
    query: NameParam,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<FileEntry> {
    let name = match non_empty(query.name) {
        Some(name) => name,
        None => {
            let from_body: NameParam = json_body(&headers, body).await?;
            required(from_body.name, "name")?
        }
    };
    Ok(Json(state.catalog.delete(kind, &name).await?))
}

pub(super) async fn delete_iso(
    State(state): State<AppState>,
    Query(query): Query<NameParam>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<FileEntry> {
    delete(state, AssetKind::Iso, query, headers, body).await
}

pub(super) async fn delete_microkernel(
    State(state): State<AppState>,
    Query(query): Query<NameParam>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<FileEntry> {
    delete(state, AssetKind::Microkernel, query, headers, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: Option<&str>, isostore: Option<&str>) -> ImageParams {
        ImageParams {
            name: name.map(str::to_string),
            isostore: isostore.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn query_takes_precedence_over_body() {
        let merged = params(Some("centos"), None).or(params(Some("ubuntu"), Some("u.iso")));
        assert_eq!(merged.name.as_deref(), Some("centos"));
        assert_eq!(merged.isostore.as_deref(), Some("u.iso"));
    }

    #[test]
    fn empty_values_fall_through() {
        let merged = params(Some(""), None).or(params(Some("ubuntu"), None));
        assert_eq!(merged.name.as_deref(), Some("ubuntu"));
        assert_eq!(params(Some(""), None).or(ImageParams::default()).name, None);
    }
}
