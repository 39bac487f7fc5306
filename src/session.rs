//! Storage session start-up with a single interactive re-authentication.
use crate::error::CompositeError;
use crate::s3::{Provider, S3ObjOps};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::future::Future;

/// Run `init`; if it fails with [`CompositeError::Authentication`], run
/// `authenticate` and try `init` once more. Any other failure, and any failure
/// of the second attempt, is returned as is.
pub async fn initialize_with_recovery<T, I, IFut, A, AFut>(mut init: I, authenticate: A) -> Result<T>
where
    I: FnMut() -> IFut,
    IFut: Future<Output = Result<T>>,
    A: FnOnce() -> AFut,
    AFut: Future<Output = Result<()>>,
{
    match init().await {
        Ok(session) => Ok(session),
        Err(e) if matches!(e.downcast_ref::<CompositeError>(), Some(CompositeError::Authentication(_))) => {
            warn!("{}", e);
            info!("Authentication needed. Running interactive login...");
            authenticate().await?;
            let session = init().await?;
            info!("Session initialized successfully after authentication.");
            Ok(session)
        }
        Err(e) => Err(e),
    }
}

/// Load the profile and prove it can reach `bucket`.
pub async fn open_bucket(profile: &str, region: &str, bucket: &str) -> Result<Provider> {
    let provider = Provider::from_profile(profile, region).await;
    provider.head_bucket(bucket).await.map_err(|e| {
        CompositeError::Authentication(format!(
            "profile '{}' cannot access bucket '{}': {:#}",
            profile, bucket, e
        ))
    })?;
    info!("Session for bucket {} initialized successfully.", bucket);
    Ok(provider)
}

/// Interactive single sign-on for `profile` through the AWS CLI.
pub async fn interactive_login(profile: &str) -> Result<()> {
    let status = tokio::process::Command::new("aws")
        .args(["sso", "login", "--profile", profile])
        .status()
        .await?;
    if !status.success() {
        return Err(anyhow!("aws sso login exited with {}", status));
    }
    Ok(())
}

/// A provider for `bucket`, logging in interactively at most once.
pub async fn initialize(profile: &str, region: &str, bucket: &str) -> Result<Provider> {
    initialize_with_recovery(
        || open_bucket(profile, region, bucket),
        || interactive_login(profile),
    )
    .await
}
