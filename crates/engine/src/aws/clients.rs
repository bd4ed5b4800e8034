//! AWS SDK client initialisation for KMS.

use aws_config::BehaviorVersion;

/// Build an AWS KMS client.
///
/// Credentials and region are resolved through the standard AWS chain
/// (environment, profile, IMDS). When `endpoint_url` is set every request is
/// sent there instead of the regional KMS endpoint.
pub async fn build_kms_client(endpoint_url: Option<&str>) -> aws_sdk_kms::Client {
    let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

    let mut builder = aws_sdk_kms::config::Builder::from(&config);
    if let Some(url) = endpoint_url {
        builder = builder.endpoint_url(url);
    }
    aws_sdk_kms::Client::from_conf(builder.build())
}
