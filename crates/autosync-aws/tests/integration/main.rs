//! Integration tests for autosync-aws
//!
//! Uses wiremock to stand in for S3 and SSM and verifies request shapes,
//! response parsing and error classification of the adapters.

mod common;

mod test_parameter_store;
mod test_s3_store;
