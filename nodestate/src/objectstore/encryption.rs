//! Server-side encryption settings resolved from an artifact descriptor.

use crate::core::S3EncryptionOptions;
use crate::errors::{NodeStateError, Result};
use crate::substrate::SecretStore;
use std::collections::BTreeMap;
use std::fmt;

const CUSTOMER_KEY_BYTES: usize = 32;

/// How objects are encrypted at rest.
#[derive(Clone, PartialEq, Eq)]
pub enum ServerSideEncryption {
    /// SSE-S3.
    S3,
    /// SSE-KMS with a key and optional encryption context.
    Kms {
        /// KMS key ID.
        key_id: String,
        /// Encryption context.
        context: BTreeMap<String, String>,
    },
    /// SSE-C with a 256-bit customer key.
    CustomerKey(Vec<u8>),
}

impl ServerSideEncryption {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::S3 => "sse-s3",
            Self::Kms { .. } => "sse-kms",
            Self::CustomerKey(_) => "sse-c",
        }
    }

    /// Resolves encryption options, reading the customer key from `secrets`.
    ///
    /// Returns `None` when encryption is disabled.
    pub async fn resolve(
        options: Option<&S3EncryptionOptions>,
        secure: bool,
        secrets: &dyn SecretStore,
    ) -> Result<Option<Self>> {
        let Some(options) = options else {
            return Ok(None);
        };
        if options.kms_key_id.is_some() && options.server_side_customer_key_secret.is_some() {
            return Err(NodeStateError::validation(
                "serverSideCustomerKeySecret and kmsKeyId cannot be set together",
            ));
        }
        if options.server_side_customer_key_secret.is_some() && !secure {
            return Err(NodeStateError::validation(
                "server-side customer keys require a secure connection",
            ));
        }
        if !options.enable_encryption {
            return Ok(None);
        }

        if let Some(selector) = &options.server_side_customer_key_secret {
            let key = secrets.read(&selector.name, &selector.key).await?;
            if key.len() != CUSTOMER_KEY_BYTES {
                return Err(NodeStateError::validation(format!(
                    "server-side customer key must be {CUSTOMER_KEY_BYTES} bytes, got {}",
                    key.len()
                )));
            }
            return Ok(Some(Self::CustomerKey(key)));
        }

        if let Some(key_id) = &options.kms_key_id {
            let context = match options.kms_encryption_context.as_deref() {
                None | Some("") => BTreeMap::new(),
                Some(raw) => serde_json::from_str(raw).map_err(|e| {
                    NodeStateError::validation(format!("invalid kmsEncryptionContext: {e}"))
                })?,
            };
            return Ok(Some(Self::Kms {
                key_id: key_id.clone(),
                context,
            }));
        }

        Ok(Some(Self::S3))
    }
}

impl fmt::Debug for ServerSideEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 => write!(f, "S3"),
            Self::Kms { key_id, context } => f
                .debug_struct("Kms")
                .field("key_id", key_id)
                .field("context", context)
                .finish(),
            Self::CustomerKey(_) => write!(f, "CustomerKey(<redacted>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SecretKeySelector;
    use crate::substrate::memory::InMemorySecretStore;

    fn options() -> S3EncryptionOptions {
        S3EncryptionOptions {
            enable_encryption: true,
            ..S3EncryptionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_is_none() {
        let secrets = InMemorySecretStore::new();
        assert!(ServerSideEncryption::resolve(None, true, &secrets).await.unwrap().is_none());
        let off = S3EncryptionOptions::default();
        assert!(ServerSideEncryption::resolve(Some(&off), true, &secrets)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_kms_with_context() {
        let secrets = InMemorySecretStore::new();
        let opts = S3EncryptionOptions {
            kms_key_id: Some("key-1".into()),
            kms_encryption_context: Some(r#"{"team":"data"}"#.into()),
            ..options()
        };
        let sse = ServerSideEncryption::resolve(Some(&opts), true, &secrets)
            .await
            .unwrap()
            .unwrap();
        match sse {
            ServerSideEncryption::Kms { key_id, context } => {
                assert_eq!(key_id, "key-1");
                assert_eq!(context.get("team").map(String::as_str), Some("data"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kms_and_customer_key_conflict() {
        let secrets = InMemorySecretStore::new();
        let opts = S3EncryptionOptions {
            kms_key_id: Some("key-1".into()),
            server_side_customer_key_secret: Some(SecretKeySelector::new("sse", "key")),
            ..options()
        };
        assert!(ServerSideEncryption::resolve(Some(&opts), true, &secrets).await.is_err());
    }

    #[tokio::test]
    async fn test_customer_key_requires_secure() {
        let secrets = InMemorySecretStore::new().with_secret("sse", "key", vec![7u8; 32]);
        let opts = S3EncryptionOptions {
            server_side_customer_key_secret: Some(SecretKeySelector::new("sse", "key")),
            ..options()
        };
        assert!(ServerSideEncryption::resolve(Some(&opts), false, &secrets).await.is_err());
        let sse = ServerSideEncryption::resolve(Some(&opts), true, &secrets)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sse.kind(), "sse-c");
        assert_eq!(format!("{sse:?}"), "CustomerKey(<redacted>)");
    }
}
