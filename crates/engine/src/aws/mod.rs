//! AWS KMS backend for the [`crate::kms::KmsClient`] contract.
//!
//! The client is built from the standard AWS credential and region chain, with
//! an optional endpoint override for LocalStack-style deployments.

pub mod clients;
pub mod kms;

pub use clients::build_kms_client;
pub use kms::AwsKms;
