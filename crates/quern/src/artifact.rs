//! Fetching model weights from an artifact repository.
//!
//! Weights are multi-gigabyte files, so the download streams straight to
//! disk through a `.partial` file that is only renamed into place once the
//! transfer completes. A crash mid-download never leaves a truncated file
//! where the loader expects real weights.

use std::path::Path;

use anyhow::Context;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::ArtifactSettings;

/// Repository layout: `{base}/repository/{repo}/{artifact_id}/{version}/{file}`.
pub fn artifact_url(settings: &ArtifactSettings) -> String {
    format!(
        "{}/repository/{}/{}/{}/{}",
        settings.url.trim_end_matches('/'),
        settings.repository,
        settings.artifact_id,
        settings.version,
        settings.file_name
    )
}

/// Make sure the model file at `destination` exists, downloading it from
/// the configured repository if it does not.
pub async fn ensure_model_artifact(
    settings: &ArtifactSettings,
    destination: &Path,
) -> anyhow::Result<()> {
    if destination.exists() {
        tracing::info!(path = %destination.display(), "model file already present");
        return Ok(());
    }
    if !settings.enabled {
        anyhow::bail!(
            "model file {} does not exist and artifact download is disabled",
            destination.display()
        );
    }

    let url = artifact_url(settings);
    tracing::info!(url = %url, path = %destination.display(), "downloading model artifact");

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating model directory {}", parent.display()))?;
    }

    let client = reqwest::Client::new();
    let mut request = client.get(&url);
    if let Some(login) = &settings.login {
        request = request.basic_auth(login, settings.password.as_deref());
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("requesting artifact from {url}"))?
        .error_for_status()
        .with_context(|| format!("artifact request to {url} failed"))?;

    let partial = destination.with_extension("partial");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("creating {}", partial.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading artifact body")?;
        downloaded += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
    }
    file.flush().await.context("flushing downloaded artifact")?;
    drop(file);

    tokio::fs::rename(&partial, destination)
        .await
        .with_context(|| format!("moving artifact into place at {}", destination.display()))?;
    tracing::info!(bytes = downloaded, path = %destination.display(), "model artifact downloaded");
    Ok(())
}
