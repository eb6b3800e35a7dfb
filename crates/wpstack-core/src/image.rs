//! Container image tags and references.
//!
//! Every build publishes its image under a tag derived from the triggering
//! source revision, so a running service can always be traced back to the
//! commit it was built from.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Number of revision characters kept in a derived tag.
pub const SHORT_TAG_LEN: usize = 7;

/// Tag used when no usable revision is available.
pub const FALLBACK_TAG: &str = "latest";

/// A container image tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ImageTag(String);

impl ImageTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_TAG
    }

    fn fallback() -> Self {
        Self(FALLBACK_TAG.to_string())
    }
}

/// Derive the image tag for a build from the resolved source revision.
///
/// Takes the first [`SHORT_TAG_LEN`] characters of the revision. Absent,
/// blank or malformed revisions degrade to [`FALLBACK_TAG`]; derivation
/// never fails.
pub fn derive_image_tag(revision: Option<&str>) -> ImageTag {
    match revision.map(str::trim) {
        Some(rev) if is_valid_revision(rev) => ImageTag(rev.chars().take(SHORT_TAG_LEN).collect()),
        _ => ImageTag::fallback(),
    }
}

/// Whether a revision identifier can be used as the start of an image tag.
///
/// Tags allow `[A-Za-z0-9_.-]` and must not start with `.` or `-`.
pub fn is_valid_revision(revision: &str) -> bool {
    let mut chars = revision.chars();
    match chars.next() {
        None | Some('.') | Some('-') => false,
        Some(first) => is_tag_char(first) && chars.all(is_tag_char),
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Fully qualified image reference, `<repository-uri>:<tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display("{repository_uri}:{tag}")]
pub struct ImageReference {
    pub repository_uri: String,
    pub tag: ImageTag,
}

impl ImageReference {
    pub fn new(repository_uri: impl Into<String>, tag: ImageTag) -> Self {
        Self {
            repository_uri: repository_uri.into(),
            tag,
        }
    }
}
