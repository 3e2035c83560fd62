// dynamotool/src/utils/aws.rs
use aws_config::SdkConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

use crate::config::AwsSettings;

/// Builds the shared SDK configuration from explicit settings. Without static
/// keys the default credential chain applies.
pub async fn load_sdk_config(settings: &AwsSettings) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.region.clone()));

    if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
        loader = loader.credentials_provider(Credentials::new(
            key_id,
            secret,
            None,     // session_token
            None,     // expiry
            "Static", // provider_name
        ));
    }

    loader.load().await
}
