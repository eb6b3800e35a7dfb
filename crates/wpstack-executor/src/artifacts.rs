//! Filesystem artifact store.
//!
//! Files live at `<root>/<run id>/<artifact>/<file>`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wpstack_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore};
use wpstack_core::{Error, ResourceId, Result};

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &ResourceId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf> {
        check_segment("artifact", &key.artifact)?;
        check_segment("file", &key.file)?;
        Ok(self.run_dir(&key.run_id).join(&key.artifact).join(&key.file))
    }

    fn reference(
        key: ArtifactKey,
        path: &Path,
        data: &[u8],
        created_at: DateTime<Utc>,
    ) -> ArtifactRef {
        ArtifactRef {
            key,
            location: path.display().to_string(),
            checksum: checksum(data),
            size: data.len() as u64,
            created_at,
        }
    }
}

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Names become path segments, so they must not escape the run directory.
fn check_segment(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::InvalidInput(format!(
            "invalid {} name '{}'",
            what, name
        )));
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;

        let reference = Self::reference(key.clone(), &path, &data, Utc::now());
        debug!(
            run_id = %key.run_id,
            artifact = %key.artifact,
            file = %key.file,
            size = reference.size,
            "Stored artifact"
        );
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes> {
        let path = self.path_for(&reference.key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "artifact {}/{}",
                    reference.key.artifact, reference.key.file
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = checksum(&data);
        if actual != reference.checksum {
            return Err(Error::InvalidArtifact(format!(
                "checksum mismatch for {}/{}: expected {}, found {}",
                reference.key.artifact, reference.key.file, reference.checksum, actual
            )));
        }
        Ok(Bytes::from(data))
    }

    async fn list(&self, run_id: &ResourceId) -> Result<Vec<ArtifactRef>> {
        let run_dir = self.run_dir(run_id);
        let mut refs = Vec::new();

        let mut artifacts = match tokio::fs::read_dir(&run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(e) => return Err(e.into()),
        };

        while let Some(artifact) = artifacts.next_entry().await? {
            if !artifact.file_type().await?.is_dir() {
                continue;
            }
            let artifact_name = artifact.file_name().to_string_lossy().to_string();
            let mut files = tokio::fs::read_dir(artifact.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if !file.file_type().await?.is_file() {
                    continue;
                }
                let path = file.path();
                let data = tokio::fs::read(&path).await?;
                let created_at = file
                    .metadata()
                    .await?
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                let key = ArtifactKey {
                    run_id: run_id.clone(),
                    artifact: artifact_name.clone(),
                    file: file.file_name().to_string_lossy().to_string(),
                };
                refs.push(Self::reference(key, &path, &data, created_at));
            }
        }

        refs.sort_by(|a, b| {
            (&a.key.artifact, &a.key.file).cmp(&(&b.key.artifact, &b.key.file))
        });
        Ok(refs)
    }

    async fn purge(&self, run_id: &ResourceId) -> Result<u64> {
        let count = self.list(run_id).await?.len() as u64;
        let run_dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&run_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(run_id = %run_id, files = count, "Purged run artifacts");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpstack_core::artifact::{IMAGE_DEFINITIONS_FILE, ImageDefinitions};
    use wpstack_core::image::{ImageReference, derive_image_tag};

    fn key(run_id: &ResourceId) -> ArtifactKey {
        ArtifactKey {
            run_id: run_id.clone(),
            artifact: "fargateBuildOutput".to_string(),
            file: IMAGE_DEFINITIONS_FILE.to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run_id = ResourceId::new();

        let defs = ImageDefinitions::for_web(&ImageReference::new(
            "registry.local/wordpress",
            derive_image_tag(Some("abc1234def")),
        ));
        let json = defs.to_json().unwrap();

        let reference = store.put(&key(&run_id), Bytes::from(json.clone())).await.unwrap();
        assert_eq!(reference.size, json.len() as u64);
        assert_eq!(reference.checksum.len(), 64);

        let data = store.get(&reference).await.unwrap();
        let parsed = ImageDefinitions::from_json(&data).unwrap();
        assert_eq!(
            parsed.image_for("web"),
            Some("registry.local/wordpress:abc1234")
        );
    }

    #[tokio::test]
    async fn test_tampered_artifact_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run_id = ResourceId::new();

        let reference = store
            .put(&key(&run_id), Bytes::from_static(b"[]"))
            .await
            .unwrap();
        tokio::fs::write(&reference.location, b"[{}]").await.unwrap();

        assert!(matches!(
            store.get(&reference).await,
            Err(Error::InvalidArtifact(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_purge_are_scoped_to_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run_a = ResourceId::new();
        let run_b = ResourceId::new();

        store.put(&key(&run_a), Bytes::from_static(b"a")).await.unwrap();
        store.put(&key(&run_b), Bytes::from_static(b"b")).await.unwrap();

        let listed = store.list(&run_a).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key(&run_a));

        assert_eq!(store.purge(&run_a).await.unwrap(), 1);
        assert!(store.list(&run_a).await.unwrap().is_empty());
        assert_eq!(store.list(&run_b).await.unwrap().len(), 1);

        // purging twice is harmless
        assert_eq!(store.purge(&run_a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let mut bad = key(&ResourceId::new());
        bad.file = "../escape.json".to_string();

        assert!(matches!(
            store.put(&bad, Bytes::from_static(b"x")).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let reference = FsArtifactStore::reference(
            key(&ResourceId::new()),
            Path::new("/nowhere"),
            b"",
            Utc::now(),
        );
        assert!(matches!(store.get(&reference).await, Err(Error::NotFound(_))));
    }
}
