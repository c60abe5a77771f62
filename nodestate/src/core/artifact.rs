//! Artifact descriptors.
//!
//! An [`Artifact`] is a named file or directory plus exactly one location.
//! Credentials are never embedded in a descriptor; they are referenced as
//! secret keys and resolved by the driver factory.

use crate::config::TransferConfig;
use crate::errors::{NodeStateError, Result};
use serde::{Deserialize, Serialize};

/// Reference to one key of a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretKeySelector {
    /// Secret name.
    pub name: String,
    /// Key within the secret.
    pub key: String,
}

impl SecretKeySelector {
    /// Creates a new selector.
    #[must_use]
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

/// Server-side encryption settings for S3 writes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EncryptionOptions {
    /// Enables SSE-S3 or SSE-KMS.
    #[serde(default)]
    pub enable_encryption: bool,
    /// KMS key ID; implies SSE-KMS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    /// JSON encryption context passed to KMS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_encryption_context: Option<String>,
    /// Customer-provided key (SSE-C).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_side_customer_key_secret: Option<SecretKeySelector>,
}

/// An object in an S3-compatible store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Artifact {
    /// Bucket name.
    pub bucket: String,
    /// Object key, or key prefix for directories.
    pub key: String,
    /// Endpoint host (and optional port).
    #[serde(default)]
    pub endpoint: String,
    /// Region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Use TLS.
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Access key reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_secret: Option<SecretKeySelector>,
    /// Secret key reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_secret: Option<SecretKeySelector>,
    /// Session token reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token_secret: Option<SecretKeySelector>,
    /// Server-side encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<S3EncryptionOptions>,
    /// Create the bucket before the first write if it does not exist.
    #[serde(default)]
    pub create_bucket_if_not_present: bool,
    /// Directory transfer options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferConfig>,
}

fn default_secure() -> bool {
    true
}

/// A single HTTP header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Header name.
    pub name: String,
    /// Literal value.
    #[serde(default)]
    pub value: String,
    /// Value taken from a secret instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<SecretKeySelector>,
}

impl Header {
    /// Creates a header with a literal value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            value_from: None,
        }
    }
}

/// Basic-auth credentials taken from secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    /// Username reference.
    pub username_secret: SecretKeySelector,
    /// Password reference.
    pub password_secret: SecretKeySelector,
}

/// An artifact served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpArtifact {
    /// Target URL.
    pub url: String,
    /// Method override for writes (default PUT).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Extra headers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    /// Request body for reads that need one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Basic-auth credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

/// A path on an in-cluster volume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeArtifact {
    /// Volume name.
    pub volume_name: String,
    /// Path within the volume.
    #[serde(default)]
    pub sub_path: String,
}

/// Data carried inline in the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InlineArtifact {
    /// Raw data.
    pub data: String,
}

/// Where an artifact lives. Exactly one variant per artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactLocation {
    /// S3-compatible object store.
    S3(S3Artifact),
    /// HTTP endpoint.
    Http(HttpArtifact),
    /// In-cluster volume.
    Volume(VolumeArtifact),
    /// Inline data.
    #[serde(rename = "raw")]
    Inline(InlineArtifact),
}

impl ArtifactLocation {
    /// Short name of the location variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::S3(_) => "s3",
            Self::Http(_) => "http",
            Self::Volume(_) => "volume",
            Self::Inline(_) => "inline",
        }
    }
}

/// A named file or directory with a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Artifact name, unique within its inputs or outputs.
    pub name: String,
    /// Mount path inside a step pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// The location.
    #[serde(flatten)]
    pub location: ArtifactLocation,
}

impl Artifact {
    /// Creates an artifact.
    #[must_use]
    pub fn new(name: impl Into<String>, location: ArtifactLocation) -> Self {
        Self {
            name: name.into(),
            path: None,
            location,
        }
    }

    /// Creates an S3 artifact.
    #[must_use]
    pub fn s3(name: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(
            name,
            ArtifactLocation::S3(S3Artifact {
                bucket: bucket.into(),
                key: key.into(),
                secure: true,
                ..S3Artifact::default()
            }),
        )
    }

    /// Creates an HTTP artifact.
    #[must_use]
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            ArtifactLocation::Http(HttpArtifact {
                url: url.into(),
                ..HttpArtifact::default()
            }),
        )
    }

    /// Creates a volume artifact.
    #[must_use]
    pub fn volume(
        name: impl Into<String>,
        volume_name: impl Into<String>,
        sub_path: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            ArtifactLocation::Volume(VolumeArtifact {
                volume_name: volume_name.into(),
                sub_path: sub_path.into(),
            }),
        )
    }

    /// Creates an inline artifact.
    #[must_use]
    pub fn inline(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(
            name,
            ArtifactLocation::Inline(InlineArtifact { data: data.into() }),
        )
    }

    /// Sets the mount path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns the S3 location, or a validation error for other variants.
    pub fn as_s3(&self) -> Result<&S3Artifact> {
        match &self.location {
            ArtifactLocation::S3(s3) => Ok(s3),
            other => Err(self.wrong_location("s3", other)),
        }
    }

    /// Returns the HTTP location, or a validation error for other variants.
    pub fn as_http(&self) -> Result<&HttpArtifact> {
        match &self.location {
            ArtifactLocation::Http(http) => Ok(http),
            other => Err(self.wrong_location("http", other)),
        }
    }

    /// Returns the volume location, or a validation error for other variants.
    pub fn as_volume(&self) -> Result<&VolumeArtifact> {
        match &self.location {
            ArtifactLocation::Volume(volume) => Ok(volume),
            other => Err(self.wrong_location("volume", other)),
        }
    }

    /// Returns a copy of this S3 artifact pointing at another key.
    #[must_use]
    pub fn with_s3_key(&self, key: impl Into<String>) -> Self {
        let mut copy = self.clone();
        if let ArtifactLocation::S3(s3) = &mut copy.location {
            s3.key = key.into();
        }
        copy
    }

    fn wrong_location(&self, expected: &str, actual: &ArtifactLocation) -> NodeStateError {
        NodeStateError::validation(format!(
            "artifact '{}' has {} location, expected {expected}",
            self.name,
            actual.kind()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_location_is_flattened() {
        let art = Artifact::s3("out", "my-bucket", "path/out.tgz");
        let json = serde_json::to_value(&art).unwrap();
        assert_eq!(json["name"], "out");
        assert_eq!(json["s3"]["bucket"], "my-bucket");
        assert_eq!(json["s3"]["key"], "path/out.tgz");

        let back: Artifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, art);
    }

    #[test]
    fn test_secure_defaults_true() {
        let art: Artifact =
            serde_json::from_str(r#"{"name":"a","s3":{"bucket":"b","key":"k"}}"#).unwrap();
        assert!(art.as_s3().unwrap().secure);
    }

    #[test]
    fn test_wrong_location_is_validation_error() {
        let art = Artifact::inline("a", "hello");
        let err = art.as_s3().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);
        assert!(err.to_string().contains("inline"));
    }

    #[test]
    fn test_with_s3_key() {
        let art = Artifact::s3("a", "b", "dir/");
        let child = art.with_s3_key("dir/file.txt");
        assert_eq!(child.as_s3().unwrap().key, "dir/file.txt");
        assert_eq!(art.as_s3().unwrap().key, "dir/");
    }
}
