//! Live snapshot action on a single server.
//!
//! The check order is fixed: authorization, payload validation, metadata
//! quota, instance lookup, eligibility, delegation. A malformed request is
//! rejected before the instance is looked up.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use live_image_common::{
    ComputeApi, ComputeError, ImageMetadata, Instance, MetadataQuota, PolicyEnforcer,
    RequestContext, SnapshotImage,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Top-level key of the action body.
pub const ACTION_KEY: &str = "createLiveImage";

/// Policy checked before anything else happens.
pub const EXTENSION_POLICY: &str = "compute_extension:create-live-image";

const UNPROCESSABLE_MESSAGE: &str = "Unable to process the contained instructions";
const INTERNAL_MESSAGE: &str =
    "The server has either erred or is incapable of performing the requested operation.";

/// Validated `createLiveImage` entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    pub name: String,
    /// Raw metadata value; its shape is checked together with the quota.
    pub metadata: Option<Value>,
}

impl SnapshotRequest {
    /// Parse the raw action body. An empty body or a body without the
    /// action key is an empty entity, which then fails on the missing name.
    pub fn from_body(body: &[u8]) -> Result<Self, AppError> {
        let mut document = parse_document(body)?;

        let entity = document
            .remove(ACTION_KEY)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let Value::Object(mut entity) = entity else {
            return Err(AppError::BadRequest(format!(
                "{ACTION_KEY} entity must be an object"
            )));
        };

        let name = match entity.remove("name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(AppError::BadRequest(format!(
                    "{ACTION_KEY} entity requires name attribute"
                )))
            }
        };

        let metadata = entity.remove("metadata").filter(|value| !value.is_null());

        Ok(Self { name, metadata })
    }
}

fn parse_document(body: &[u8]) -> Result<Map<String, Value>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(_) => Err(AppError::BadRequest(
            "Malformed request body: expected a JSON object".to_string(),
        )),
        Err(e) => Err(AppError::BadRequest(format!("Malformed request body: {e}"))),
    }
}

/// Convert a metadata value into image properties. Only a mapping of
/// strings to strings is accepted.
pub fn image_metadata_from_value(value: Value) -> Result<ImageMetadata, String> {
    let Value::Object(entries) = value else {
        return Err(format!("expected a mapping, got {}", json_kind(&value)));
    };

    entries
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(value) => Ok((key, value)),
            other => Err(format!(
                "value for '{key}' must be a string, got {}",
                json_kind(&other)
            )),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `<application_url>/<project_id>/images/<image_id>`
pub fn image_location(application_url: &str, project_id: &str, image_id: &str) -> String {
    format!(
        "{}/{}/images/{}",
        application_url.trim_end_matches('/'),
        project_id,
        image_id
    )
}

/// Successful outcome: 202 with the new image's location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub location: String,
}

impl IntoResponse for Accepted {
    fn into_response(self) -> Response {
        (StatusCode::ACCEPTED, [(header::LOCATION, self.location)]).into_response()
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    /// Authorization denied; carries the policy engine's message unchanged.
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    /// Unexpected delegate failure. Details stay in the server log.
    Unprocessable,
    Internal,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn invalid_metadata() -> Self {
        AppError::BadRequest("Invalid image metadata".to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg) => msg,
            AppError::Unprocessable => UNPROCESSABLE_MESSAGE.to_string(),
            AppError::Internal => INTERNAL_MESSAGE.to_string(),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

/// Map a failure raised while checking eligibility or taking the snapshot.
fn delegate_error(err: ComputeError) -> AppError {
    match err {
        ComputeError::InstanceInvalidState {
            ref attr,
            ref state,
            ..
        } => AppError::Conflict(format!(
            "Cannot '{ACTION_KEY}' while instance is in {attr} {state}"
        )),
        denied @ ComputeError::PolicyNotAuthorized { .. } => {
            AppError::Forbidden(denied.to_string())
        }
        other => {
            error!(error = %other, "compute.api::live_snapshot failure");
            AppError::Unprocessable
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct LiveImageController {
    compute: Arc<dyn ComputeApi>,
    policy: Arc<dyn PolicyEnforcer>,
    quota: Arc<dyn MetadataQuota>,
}

impl LiveImageController {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        policy: Arc<dyn PolicyEnforcer>,
        quota: Arc<dyn MetadataQuota>,
    ) -> Self {
        Self {
            compute,
            policy,
            quota,
        }
    }

    /// Live-snapshot a server instance.
    #[instrument(
        skip(self, ctx, application_url, body),
        fields(request_id = %ctx.request_id, project_id = %ctx.project_id)
    )]
    pub async fn live_snapshot(
        &self,
        ctx: &RequestContext,
        application_url: &str,
        instance_id: &str,
        body: &[u8],
    ) -> Result<Accepted, AppError> {
        self.authorize(ctx).await?;

        let request = SnapshotRequest::from_body(body).map_err(|e| {
            debug!("Rejecting {} request: {:?}", ACTION_KEY, e);
            e
        })?;
        let properties = self.check_metadata(ctx, request.metadata).await?;

        let instance = self.get_instance(ctx, instance_id).await?;
        let image = self
            .snapshot(ctx, &instance, &request.name, properties)
            .await?;

        let location = image_location(application_url, &ctx.project_id, &image.id);
        info!(
            "Live snapshot {} of instance {} accepted: {}",
            image.id, instance.uuid, location
        );

        Ok(Accepted { location })
    }

    async fn authorize(&self, ctx: &RequestContext) -> Result<(), AppError> {
        match self
            .policy
            .authorize(ctx, EXTENSION_POLICY, &ctx.default_target())
            .await
        {
            Ok(()) => Ok(()),
            Err(denied @ ComputeError::PolicyNotAuthorized { .. }) => {
                info!("Authorization denied for {}: {}", ctx, denied);
                Err(AppError::Forbidden(denied.to_string()))
            }
            Err(other) => {
                error!(error = %other, "policy check failure");
                Err(AppError::Internal)
            }
        }
    }

    async fn check_metadata(
        &self,
        ctx: &RequestContext,
        metadata: Option<Value>,
    ) -> Result<ImageMetadata, AppError> {
        let Some(value) = metadata else {
            return Ok(ImageMetadata::new());
        };

        let metadata = image_metadata_from_value(value).map_err(|reason| {
            info!("Malformed image metadata: {}", reason);
            AppError::invalid_metadata()
        })?;

        match self.quota.check_metadata_quota(ctx, &metadata).await {
            Ok(()) => Ok(metadata),
            Err(err @ (ComputeError::OverQuota { .. } | ComputeError::InvalidMetadata(_))) => {
                info!("Image metadata rejected by quota: {}", err);
                Err(AppError::invalid_metadata())
            }
            Err(denied @ ComputeError::PolicyNotAuthorized { .. }) => {
                Err(AppError::Forbidden(denied.to_string()))
            }
            Err(other) => {
                error!(error = %other, "metadata quota check failure");
                Err(AppError::Internal)
            }
        }
    }

    async fn get_instance(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
    ) -> Result<Instance, AppError> {
        match self.compute.get(ctx, instance_id).await {
            Ok(instance) => Ok(instance),
            Err(ComputeError::InstanceNotFound(_)) => {
                Err(AppError::NotFound("Instance could not be found".to_string()))
            }
            Err(denied @ ComputeError::PolicyNotAuthorized { .. }) => {
                Err(AppError::Forbidden(denied.to_string()))
            }
            Err(other) => {
                error!(error = %other, "compute.api::get failure");
                Err(AppError::Internal)
            }
        }
    }

    async fn snapshot(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        name: &str,
        properties: ImageMetadata,
    ) -> Result<SnapshotImage, AppError> {
        let bdms = self
            .compute
            .get_instance_bdms(ctx, instance)
            .await
            .map_err(delegate_error)?;

        let volume_backed = self
            .compute
            .is_volume_backed_instance(ctx, instance, &bdms)
            .await
            .map_err(delegate_error)?;
        if volume_backed {
            return Err(AppError::BadRequest(
                "Live snapshot of volume backed instances not allowed".to_string(),
            ));
        }

        self.compute
            .live_snapshot(ctx, instance, name, properties)
            .await
            .map_err(delegate_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> Result<SnapshotRequest, AppError> {
        SnapshotRequest::from_body(body.to_string().as_bytes())
    }

    #[test]
    fn test_missing_name_is_bad_request() {
        let err = parse(json!({ "createLiveImage": {} })).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = parse(json!({ "createLiveImage": { "name": "" } })).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = parse(json!({ "createLiveImage": { "name": 7 } })).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_action_key_is_empty_entity() {
        let err = parse(json!({ "somethingElse": { "name": "x" } })).unwrap_err();
        assert_eq!(
            err,
            AppError::BadRequest("createLiveImage entity requires name attribute".to_string())
        );

        let err = SnapshotRequest::from_body(b"").unwrap_err();
        assert_eq!(
            err,
            AppError::BadRequest("createLiveImage entity requires name attribute".to_string())
        );
    }

    #[test]
    fn test_malformed_documents() {
        assert!(SnapshotRequest::from_body(b"{not json").is_err());
        assert!(SnapshotRequest::from_body(b"[1, 2]").is_err());
        assert!(parse(json!({ "createLiveImage": "snap" })).is_err());
    }

    #[test]
    fn test_valid_request_keeps_raw_metadata() {
        let request = parse(json!({
            "createLiveImage": { "name": "snap1", "metadata": "not-a-map" }
        }))
        .unwrap();
        assert_eq!(request.name, "snap1");
        assert_eq!(request.metadata, Some(json!("not-a-map")));

        let request = parse(json!({
            "createLiveImage": { "name": "snap1", "metadata": null }
        }))
        .unwrap();
        assert!(request.metadata.is_none());
    }

    #[test]
    fn test_metadata_must_map_strings_to_strings() {
        let metadata = image_metadata_from_value(json!({ "os": "linux" })).unwrap();
        assert_eq!(metadata.get("os").map(String::as_str), Some("linux"));

        assert!(image_metadata_from_value(json!("not-a-map")).is_err());
        assert!(image_metadata_from_value(json!(["a"])).is_err());
        assert!(image_metadata_from_value(json!({ "count": 3 })).is_err());
    }

    #[test]
    fn test_image_location() {
        assert_eq!(
            image_location("http://host/v3", "123", "abc123"),
            "http://host/v3/123/images/abc123"
        );
        assert_eq!(
            image_location("http://host/v3/", "123", "abc123"),
            "http://host/v3/123/images/abc123"
        );
    }

    #[test]
    fn test_delegate_error_mapping() {
        let err = delegate_error(ComputeError::InstanceInvalidState {
            instance_uuid: "i-1".to_string(),
            attr: "vm_state".to_string(),
            state: "stopped".to_string(),
            method: "live_snapshot".to_string(),
        });
        assert_eq!(
            err,
            AppError::Conflict(
                "Cannot 'createLiveImage' while instance is in vm_state stopped".to_string()
            )
        );

        let err = delegate_error(ComputeError::PolicyNotAuthorized {
            action: "compute:live_snapshot".to_string(),
        });
        assert_eq!(
            err,
            AppError::Forbidden(
                "Policy doesn't allow compute:live_snapshot to be performed.".to_string()
            )
        );

        let err = delegate_error(ComputeError::Internal("hypervisor socket closed".to_string()));
        assert_eq!(err, AppError::Unprocessable);
    }

    #[tokio::test]
    async fn test_unprocessable_body_has_no_detail() {
        let response = AppError::Unprocessable.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], UNPROCESSABLE_MESSAGE);
    }

    #[test]
    fn test_accepted_sets_location() {
        let response = Accepted {
            location: "http://host/v3/123/images/abc123".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "http://host/v3/123/images/abc123"
        );
    }
}
