//! Artifact storage abstraction and the image-definitions document.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::image::ImageReference;
use crate::{Error, ResourceId, Result};

/// File name of the image-definitions artifact emitted by builds.
pub const IMAGE_DEFINITIONS_FILE: &str = "imagedefinitions.json";

/// Logical container name the build publishes its image for.
pub const WEB_CONTAINER: &str = "web";

/// Key for storing/retrieving an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Pipeline run ID.
    pub run_id: ResourceId,
    /// Artifact name declared in the pipeline.
    pub artifact: String,
    /// File name inside the artifact.
    pub file: String,
}

/// Reference to a stored artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    /// Storage location (backend-specific).
    pub location: String,
    /// Hex-encoded SHA-256 of the content.
    pub checksum: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Trait for artifact storage backends.
///
/// Artifacts are scoped to a single run and purged when it ends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact file.
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact file, verifying its checksum.
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes>;

    /// List artifact files stored for a run.
    async fn list(&self, run_id: &ResourceId) -> Result<Vec<ArtifactRef>>;

    /// Delete everything stored for a run.
    async fn purge(&self, run_id: &ResourceId) -> Result<u64>;
}

/// One entry of the image-definitions document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// Container name in the service's task definition.
    pub name: String,
    /// Fully qualified image reference including tag.
    #[serde(rename = "imageUri")]
    pub image_uri: String,
}

/// The image-definitions document handed from build to deploy.
///
/// Serialized as a JSON array: `[{"name":"web","imageUri":"…"}]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageDefinitions(Vec<ImageDefinition>);

impl ImageDefinitions {
    /// Document publishing `image` for the `web` container.
    pub fn for_web(image: &ImageReference) -> Self {
        Self(vec![ImageDefinition {
            name: WEB_CONTAINER.to_string(),
            image_uri: image.to_string(),
        }])
    }

    pub fn entries(&self) -> &[ImageDefinition] {
        &self.0
    }

    pub fn image_for(&self, container: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|d| d.name == container)
            .map(|d| d.image_uri.as_str())
    }

    pub fn to_json(&self) -> Result<String> {
        self.validate()?;
        serde_json::to_string(&self.0).map_err(|e| Error::InvalidArtifact(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let defs: Self = serde_json::from_slice(data)
            .map_err(|e| Error::InvalidArtifact(format!("{}: {}", IMAGE_DEFINITIONS_FILE, e)))?;
        defs.validate()?;
        Ok(defs)
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidArtifact(format!(
                "{} contains no image definitions",
                IMAGE_DEFINITIONS_FILE
            )));
        }
        let mut seen = HashSet::new();
        for def in &self.0 {
            if def.name.is_empty() || def.image_uri.is_empty() {
                return Err(Error::InvalidArtifact(format!(
                    "{} entry has an empty name or imageUri",
                    IMAGE_DEFINITIONS_FILE
                )));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(Error::InvalidArtifact(format!(
                    "container '{}' listed twice",
                    def.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::derive_image_tag;

    fn reference(revision: Option<&str>) -> ImageReference {
        ImageReference::new(
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/wordpress",
            derive_image_tag(revision),
        )
    }

    #[test]
    fn test_document_shape() {
        let json = ImageDefinitions::for_web(&reference(Some("0123456789")))
            .to_json()
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        let entry = entries[0].as_object().unwrap();
        assert_eq!(entry.len(), 2);
        assert_eq!(entry["name"], "web");
        assert_eq!(
            entry["imageUri"],
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/wordpress:0123456"
        );
    }

    #[test]
    fn test_fallback_tag_document_is_valid() {
        let json = ImageDefinitions::for_web(&reference(None)).to_json().unwrap();
        let parsed = ImageDefinitions::from_json(json.as_bytes()).unwrap();
        assert!(parsed.image_for("web").unwrap().ends_with(":latest"));
    }

    #[test]
    fn test_parses_external_document() {
        let defs = ImageDefinitions::from_json(
            br#"[{"name":"web","imageUri":"registry.local/wordpress:abc1234"}]"#,
        )
        .unwrap();
        assert_eq!(defs.image_for("web"), Some("registry.local/wordpress:abc1234"));
        assert_eq!(defs.image_for("worker"), None);
    }

    #[test]
    fn test_rejects_empty_document() {
        let err = ImageDefinitions::from_json(b"[]").unwrap_err();
        assert!(matches!(err, Error::InvalidArtifact(_)));
    }

    #[test]
    fn test_rejects_missing_image_uri() {
        assert!(ImageDefinitions::from_json(br#"[{"name":"web","imageUri":""}]"#).is_err());
        assert!(ImageDefinitions::from_json(br#"[{"name":"web"}]"#).is_err());
    }

    #[test]
    fn test_rejects_duplicate_containers() {
        let data = br#"[{"name":"web","imageUri":"a:1"},{"name":"web","imageUri":"a:2"}]"#;
        assert!(ImageDefinitions::from_json(data).is_err());
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(ImageDefinitions::from_json(b"web=registry/wordpress:latest").is_err());
    }
}
