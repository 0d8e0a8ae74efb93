//! Image lookup with a fixed fallback.

use convoscope_core::{PipelineError, PipelineResult};
use std::path::Path;

/// Plain file names only; anything that could leave the image directory counts as missing.
fn safe_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        None
    } else {
        Some(name)
    }
}

/// Bytes of `dir/name`, or of `fallback` when the name is unsafe, absent or unreadable.
/// Only a missing fallback is an error.
pub async fn load_image(
    dir: &Path,
    fallback: &Path,
    name: Option<&str>,
) -> PipelineResult<Vec<u8>> {
    if let Some(name) = name.and_then(safe_name) {
        match tokio::fs::read(dir.join(name)).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => tracing::warn!(image = name, error = %e, "image missing; serving fallback"),
        }
    } else {
        tracing::warn!(image = ?name, "invalid image name; serving fallback");
    }
    tokio::fs::read(fallback)
        .await
        .map_err(|e| {
            PipelineError::ResourceMissing(format!("fallback image {}: {}", fallback.display(), e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("cse");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("rust.jpg"), b"rust").await.unwrap();
        tokio::fs::write(root.path().join("secret.jpg"), b"secret").await.unwrap();
        let fallback = root.path().join("404.jpg");
        tokio::fs::write(&fallback, b"fallback").await.unwrap();
        (root, dir, fallback)
    }

    #[tokio::test]
    async fn serves_named_image() {
        let (_root, dir, fallback) = fixture().await;
        assert_eq!(load_image(&dir, &fallback, Some("rust.jpg")).await.unwrap(), b"rust");
    }

    #[tokio::test]
    async fn missing_or_escaping_names_get_the_fallback() {
        let (_root, dir, fallback) = fixture().await;
        for name in [Some("nope.jpg"), Some("../secret.jpg"), Some(""), None] {
            assert_eq!(load_image(&dir, &fallback, name).await.unwrap(), b"fallback");
        }
    }

    #[tokio::test]
    async fn missing_fallback_is_resource_missing() {
        let root = tempfile::tempdir().unwrap();
        let err = load_image(root.path(), &root.path().join("none.jpg"), Some("x.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ResourceMissing(_)));
    }
}
