//! Shared helpers: mock server plus adapters pointed at it

use wiremock::MockServer;

use autosync_aws::{endpoint_config, S3ObjectStore, SsmParameterStore};

pub async fn setup_s3_mock() -> (MockServer, S3ObjectStore) {
    let server = MockServer::start().await;
    let config = endpoint_config(&server.uri(), "test-key", "test-secret").await;
    (server, S3ObjectStore::new(config, true))
}

pub async fn setup_ssm_mock() -> (MockServer, SsmParameterStore) {
    let server = MockServer::start().await;
    let config = endpoint_config(&server.uri(), "test-key", "test-secret").await;
    (server, SsmParameterStore::new(config))
}

/// Single `ListObjectsV2` page
pub fn list_page(objects: &[(&str, u64, &str)], next_token: Option<&str>) -> String {
    let contents: String = objects
        .iter()
        .map(|(key, size, etag)| {
            format!(
                "<Contents><Key>{key}</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified>\
                 <ETag>&quot;{etag}&quot;</ETag><Size>{size}</Size><StorageClass>STANDARD</StorageClass></Contents>"
            )
        })
        .collect();
    let continuation = next_token
        .map(|t| format!("<NextContinuationToken>{t}</NextContinuationToken>"))
        .unwrap_or_default();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Name>b</Name><Prefix>data/</Prefix><KeyCount>{}</KeyCount><MaxKeys>1000</MaxKeys>\
         <IsTruncated>{}</IsTruncated>{continuation}{contents}</ListBucketResult>",
        objects.len(),
        next_token.is_some(),
    )
}

/// `CreateMultipartUpload` response
pub fn initiate_multipart(key: &str, upload_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <InitiateMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Bucket>b</Bucket><Key>{key}</Key><UploadId>{upload_id}</UploadId>\
         </InitiateMultipartUploadResult>"
    )
}

/// `CompleteMultipartUpload` response
pub fn complete_multipart(key: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <CompleteMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Bucket>b</Bucket><Key>{key}</Key><ETag>&quot;multi-3&quot;</ETag>\
         </CompleteMultipartUploadResult>"
    )
}
