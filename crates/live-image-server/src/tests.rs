use super::*;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use std::io::Write;
use tower::ServiceExt;

const INVENTORY: &str = r#"{
    "instances": [
        {
            "uuid": "i-1",
            "project_id": "123",
            "user_id": "alice",
            "image_ref": "base-image",
            "vm_state": "active"
        }
    ]
}"#;

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn snapshot_request(project: &str, roles: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v3/servers/i-1/action")
        .header(header::HOST, "host")
        .header("X-User-Id", "alice")
        .header("X-Project-Id", project);
    if let Some(roles) = roles {
        builder = builder.header("X-Roles", roles);
    }
    builder
        .body(Body::from(r#"{"createLiveImage": {"name": "snap1"}}"#))
        .unwrap()
}

#[tokio::test]
async fn test_defaults_without_files() {
    let config = ApiServerConfig::default();
    let policy = load_policy(&config).await.unwrap();
    assert_eq!(policy.len(), RulePolicy::with_defaults().len());

    let compute = build_compute(&config, Arc::new(policy)).await.unwrap();
    assert_eq!(compute.instance_count().await, 0);
}

#[tokio::test]
async fn test_app_serves_seeded_inventory() {
    let inventory = write_temp(INVENTORY);
    let config = ApiServerConfig {
        inventory_file: Some(inventory.path().to_path_buf()),
        ..ApiServerConfig::default()
    };
    let app = create_app(config).await.unwrap();

    let response = app.oneshot(snapshot_request("123", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("http://host/v3/123/images/"));
}

#[tokio::test]
async fn test_policy_file_overrides_defaults() {
    let inventory = write_temp(INVENTORY);
    let policy = write_temp(r#"{"compute_extension:create-live-image": "role:snapshotter"}"#);
    let config = ApiServerConfig {
        inventory_file: Some(inventory.path().to_path_buf()),
        policy_file: Some(policy.path().to_path_buf()),
        ..ApiServerConfig::default()
    };
    let app = create_app(config).await.unwrap();

    let response = app
        .clone()
        .oneshot(snapshot_request("123", Some("member")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(snapshot_request("123", Some("member,snapshotter")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_configured_metadata_limit() {
    let inventory = write_temp(INVENTORY);
    let config = ApiServerConfig {
        inventory_file: Some(inventory.path().to_path_buf()),
        metadata_items: 1,
        ..ApiServerConfig::default()
    };
    let app = create_app(config).await.unwrap();

    let body = serde_json::json!({
        "createLiveImage": {"name": "snap1", "metadata": {"a": "1", "b": "2"}}
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v3/servers/i-1/action")
        .header("X-User-Id", "alice")
        .header("X-Project-Id", "123")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_files_are_errors() {
    let config = ApiServerConfig {
        policy_file: Some("/nonexistent/policy.json".into()),
        ..ApiServerConfig::default()
    };
    assert!(create_app(config).await.is_err());

    let config = ApiServerConfig {
        inventory_file: Some("/nonexistent/inventory.json".into()),
        ..ApiServerConfig::default()
    };
    assert!(create_app(config).await.is_err());
}
