//! S3 adapter against a mocked bucket (path-style addressing)

use chrono::{TimeZone, Utc};
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, ResponseTemplate};

use autosync_core::domain::errors::StoreError;
use autosync_core::ports::{ObjectLocation, RemoteObjectStore};

use crate::common;

fn location(key: &str) -> ObjectLocation {
    ObjectLocation::new("b", key, None)
}

#[tokio::test]
async fn test_head_reads_metadata_and_source_mtime() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("HEAD"))
        .and(path("/b/data/a.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"etag-1\"")
                .insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT")
                .insert_header("x-amz-meta-autosync-mtime", "2023-12-31T23:59:58.250000000Z"),
        )
        .mount(&server)
        .await;

    let record = store.head(&location("data/a.csv")).await.unwrap();

    assert!(record.exists);
    assert_eq!(record.etag.as_deref(), Some("\"etag-1\""));
    assert_eq!(
        record.last_modified,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single()
    );
    let source = record.source_modified.unwrap();
    assert_eq!(source.timestamp(), 1_704_067_198);
    assert_eq!(source.timestamp_subsec_millis(), 250);
    assert_eq!(record.content_modified(), Some(source));
}

#[tokio::test]
async fn test_head_missing_object_is_not_an_error() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("HEAD"))
        .and(path("/b/data/missing.csv"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let record = store.head(&location("data/missing.csv")).await.unwrap();
    assert!(!record.exists);
    assert_eq!(record.key, "data/missing.csv");
}

#[tokio::test]
async fn test_head_forbidden_is_permission_denied() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("HEAD"))
        .and(path("/b/data/a.csv"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = store.head(&location("data/a.csv")).await.unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied(_)), "{err:?}");
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_get_streams_body_to_file() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("GET"))
        .and(path("/b/data/a.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"id,name\n1,alpha\n".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("nested").join(".a.csv.autosync-tmp");
    let written = store
        .get(&location("data/a.csv"), &destination)
        .await
        .unwrap();

    assert_eq!(written, 16);
    assert_eq!(
        std::fs::read_to_string(&destination).unwrap(),
        "id,name\n1,alpha\n"
    );
}

#[tokio::test]
async fn test_get_server_error_is_transient() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("GET"))
        .and(path("/b/data/a.csv"))
        .respond_with(ResponseTemplate::new(503).set_body_string(
            "<Error><Code>SlowDown</Code><Message>Please reduce your request rate.</Message></Error>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = store
        .get(&location("data/a.csv"), &dir.path().join("a.csv"))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn test_put_records_source_mtime_metadata() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("PUT"))
        .and(path("/b/data/a.csv"))
        .and(header(
            "x-amz-meta-autosync-mtime",
            "2024-01-01T00:00:00.000000001Z",
        ))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-2\""))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.csv");
    std::fs::write(&source, "1,2,3").unwrap();
    let modified = Utc.timestamp_opt(1_704_067_200, 1).single();

    store
        .put(&location("data/a.csv"), &source, modified)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_put_missing_source_is_io_error() {
    let (_server, store) = common::setup_s3_mock().await;
    let dir = tempfile::tempdir().unwrap();

    let err = store
        .put(&location("data/a.csv"), &dir.path().join("gone.csv"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Io(_)), "{err:?}");
}

#[tokio::test]
async fn test_copy_sends_encoded_copy_source() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("HEAD"))
        .and(path("/b/data/my%20file.csv"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-1\""))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/b/data/my%20file.csv.bak-1704067200000"))
        .and(header("x-amz-copy-source", "b/data/my%20file.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<CopyObjectResult><ETag>\"etag-3\"</ETag>\
             <LastModified>2024-01-01T00:00:00.000Z</LastModified></CopyObjectResult>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    store
        .copy(
            &location("data/my file.csv"),
            "data/my file.csv.bak-1704067200000",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_large_put_uses_multipart_upload() {
    let (server, store) = common::setup_s3_mock().await;
    let store = store.with_multipart(8, 5);
    Mock::given(method("POST"))
        .and(path("/b/data/big.sql"))
        .and(query_param("uploads", ""))
        .and(header(
            "x-amz-meta-autosync-mtime",
            "2024-01-01T00:00:00.000000000Z",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::initiate_multipart(
            "data/big.sql",
            "upload-1",
        )))
        .expect(1)
        .mount(&server)
        .await;
    for part in ["1", "2", "3"] {
        Mock::given(method("PUT"))
            .and(path("/b/data/big.sql"))
            .and(query_param("partNumber", part))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("ETag", format!("\"part-{part}\"")),
            )
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/b/data/big.sql"))
        .and(query_param("uploadId", "upload-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(common::complete_multipart("data/big.sql")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.sql");
    std::fs::write(&source, "abcdefghijkl").unwrap();
    let modified = Utc.timestamp_opt(1_704_067_200, 0).single();

    store
        .put(&location("data/big.sql"), &source, modified)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_part_aborts_multipart_upload() {
    let (server, store) = common::setup_s3_mock().await;
    let store = store.with_multipart(8, 5);
    Mock::given(method("POST"))
        .and(path("/b/data/big.sql"))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::initiate_multipart(
            "data/big.sql",
            "upload-2",
        )))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/b/data/big.sql"))
        .and(query_param("uploadId", "upload-2"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/b/data/big.sql"))
        .and(query_param("uploadId", "upload-2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.sql");
    std::fs::write(&source, "abcdefghijkl").unwrap();

    let err = store
        .put(&location("data/big.sql"), &source, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied(_)), "{err:?}");
}

#[tokio::test]
async fn test_small_put_stays_single_request() {
    let (server, store) = common::setup_s3_mock().await;
    let store = store.with_multipart(8, 5);
    Mock::given(method("PUT"))
        .and(path("/b/data/small.sql"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-s\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("small.sql");
    std::fs::write(&source, "abcdefgh").unwrap();

    store
        .put(&location("data/small.sql"), &source, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_object() {
    let (server, store) = common::setup_s3_mock().await;
    Mock::given(method("DELETE"))
        .and(path("/b/data/a.csv"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    store.delete(&location("data/a.csv")).await.unwrap();
}

#[tokio::test]
async fn test_list_follows_continuation_tokens() {
    let (server, store) = common::setup_s3_mock().await;

    // Second page first: the more specific matcher must win.
    Mock::given(method("GET"))
        .and(path_regex(r"^/b/?$"))
        .and(query_param("list-type", "2"))
        .and(query_param("continuation-token", "page-2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(common::list_page(&[("data/c.csv", 7, "e3")], None)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/b/?$"))
        .and(query_param("list-type", "2"))
        .and(query_param("prefix", "data/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::list_page(
            &[("data/a.csv", 3, "e1"), ("data/sub/b.csv", 5, "e2")],
            Some("page-2"),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let records = store.list("b", "data/", None).await.unwrap();
    let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();

    assert_eq!(keys, vec!["data/a.csv", "data/sub/b.csv", "data/c.csv"]);
    assert_eq!(records[1].size, 5);
    assert_eq!(records[0].etag.as_deref(), Some("\"e1\""));
    assert!(records.iter().all(|r| r.exists && r.source_modified.is_none()));
}
