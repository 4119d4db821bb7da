//! SSM adapter against a mocked awsJson 1.1 endpoint

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method};
use wiremock::{Mock, ResponseTemplate};

use autosync_core::domain::errors::StoreError;
use autosync_core::ports::ParameterStore;

use crate::common;

fn json_response(status: u16, body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(status)
        .insert_header("content-type", "application/x-amz-json-1.1")
        .set_body_string(body.to_string())
}

#[tokio::test]
async fn test_put_overwrites_string_parameter() {
    let (server, store) = common::setup_ssm_mock().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", "AmazonSSM.PutParameter"))
        .and(body_partial_json(json!({
            "Name": "/backups/shop/latest-dump",
            "Value": "s3://backups/db/main/shop/dumps/from-mysql-dump_1.sql",
            "Type": "String",
            "Overwrite": true
        })))
        .respond_with(json_response(200, json!({ "Version": 4, "Tier": "Standard" })))
        .expect(1)
        .mount(&server)
        .await;

    store
        .put(
            "/backups/shop/latest-dump",
            "s3://backups/db/main/shop/dumps/from-mysql-dump_1.sql",
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_returns_value() {
    let (server, store) = common::setup_ssm_mock().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", "AmazonSSM.GetParameter"))
        .respond_with(json_response(
            200,
            json!({
                "Parameter": {
                    "Name": "/backups/shop/latest-dump",
                    "Type": "String",
                    "Value": "s3://backups/k.sql",
                    "Version": 4
                }
            }),
        ))
        .mount(&server)
        .await;

    let value = store.get("/backups/shop/latest-dump", None).await.unwrap();
    assert_eq!(value.as_deref(), Some("s3://backups/k.sql"));
}

#[tokio::test]
async fn test_get_missing_parameter_is_none() {
    let (server, store) = common::setup_ssm_mock().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", "AmazonSSM.GetParameter"))
        .respond_with(json_response(
            400,
            json!({ "__type": "ParameterNotFound", "message": "not found" }),
        ))
        .mount(&server)
        .await;

    assert_eq!(store.get("/missing", None).await.unwrap(), None);
}

#[tokio::test]
async fn test_put_access_denied_is_permission_error() {
    let (server, store) = common::setup_ssm_mock().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", "AmazonSSM.PutParameter"))
        .respond_with(json_response(
            400,
            json!({ "__type": "AccessDeniedException", "message": "not authorized" }),
        ))
        .mount(&server)
        .await;

    let err = store.put("/p", "v", None).await.unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied(_)), "{err:?}");
}

#[tokio::test]
async fn test_put_throttling_is_transient() {
    let (server, store) = common::setup_ssm_mock().await;
    Mock::given(method("POST"))
        .and(header("x-amz-target", "AmazonSSM.PutParameter"))
        .respond_with(json_response(
            400,
            json!({ "__type": "ThrottlingException", "message": "Rate exceeded" }),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let err = store.put("/p", "v", None).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}
