//! Driver construction.

use super::{ArtifactDriver, HttpDriver, InlineDriver, LoggingDriver, StreamingAdapter, VolumeDriver};
use crate::config::{LayerConfig, TransferConfig};
use crate::core::{Artifact, ArtifactLocation, HttpArtifact, S3Artifact, SecretKeySelector};
use crate::errors::{NodeStateError, Result};
use crate::objectstore::{S3ClientFactory, S3ClientOptions, S3Driver, ServerSideEncryption, TransientClassifier};
use crate::retry::RetryPolicy;
use crate::substrate::SecretStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_VOLUME_ROOT: &str = "/mnt/volumes";

/// Builds drivers for artifacts.
///
/// Secrets referenced by an artifact are read once, when its driver is
/// built, and live only as long as that driver.
pub struct DriverFactory {
    secrets: Arc<dyn SecretStore>,
    s3_clients: Option<Arc<dyn S3ClientFactory>>,
    http: reqwest::Client,
    volume_root: PathBuf,
    transfer: TransferConfig,
    retry: RetryPolicy,
    classifier: TransientClassifier,
}

impl DriverFactory {
    /// Creates a factory reading credentials from `secrets`.
    #[must_use]
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            s3_clients: default_s3_clients(),
            http: reqwest::Client::new(),
            volume_root: PathBuf::from(DEFAULT_VOLUME_ROOT),
            transfer: TransferConfig::default(),
            retry: RetryPolicy::default(),
            classifier: TransientClassifier::default(),
        }
    }

    /// Creates a factory using the transfer, retry and transient-error
    /// settings of `config`.
    pub fn from_config(secrets: Arc<dyn SecretStore>, config: &LayerConfig) -> Result<Self> {
        Ok(Self::new(secrets)
            .with_transfer(config.transfer)
            .with_retry(config.artifact_retry.clone())
            .with_classifier(TransientClassifier::with_pattern(
                config.transient_error_pattern.as_deref(),
            )?))
    }

    /// Sets the S3 client factory.
    #[must_use]
    pub fn with_s3_clients(mut self, clients: Arc<dyn S3ClientFactory>) -> Self {
        self.s3_clients = Some(clients);
        self
    }

    /// Sets the HTTP client shared by HTTP drivers.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Sets the directory volumes are mounted under.
    #[must_use]
    pub fn with_volume_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volume_root = root.into();
        self
    }

    /// Sets the default directory transfer options.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Sets the retry policy for object-store calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transient-error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Builds the driver for `artifact`'s location.
    pub async fn new_driver(&self, artifact: &Artifact) -> Result<Arc<dyn ArtifactDriver>> {
        let driver: Arc<dyn ArtifactDriver> = match &artifact.location {
            ArtifactLocation::S3(s3) => Arc::new(self.s3_driver(s3).await?),
            ArtifactLocation::Http(http) => Arc::new(self.http_driver(http).await?),
            ArtifactLocation::Volume(_) => {
                Arc::new(StreamingAdapter::new(VolumeDriver::new(self.volume_root.clone())))
            }
            ArtifactLocation::Inline(_) => Arc::new(InlineDriver),
        };
        debug!(artifact = %artifact.name, driver = driver.name(), "Built artifact driver");
        Ok(Arc::new(LoggingDriver::new(driver)))
    }

    async fn secret(&self, selector: &SecretKeySelector) -> Result<String> {
        let raw = self.secrets.read(&selector.name, &selector.key).await?;
        String::from_utf8(raw).map(|s| s.trim().to_string()).map_err(|_| {
            NodeStateError::validation(format!(
                "secret {}/{} is not valid UTF-8",
                selector.name, selector.key
            ))
        })
    }

    async fn optional_secret(&self, selector: Option<&SecretKeySelector>) -> Result<Option<String>> {
        match selector {
            Some(selector) => self.secret(selector).await.map(Some),
            None => Ok(None),
        }
    }

    async fn s3_driver(&self, s3: &S3Artifact) -> Result<S3Driver> {
        let clients = self
            .s3_clients
            .as_ref()
            .ok_or_else(|| NodeStateError::validation("no S3 client factory is configured"))?;
        let options = S3ClientOptions {
            endpoint: s3.endpoint.clone(),
            region: s3.region.clone(),
            secure: s3.secure,
            access_key: self.optional_secret(s3.access_key_secret.as_ref()).await?,
            secret_key: self.optional_secret(s3.secret_key_secret.as_ref()).await?,
            session_token: self.optional_secret(s3.session_token_secret.as_ref()).await?,
            encryption: ServerSideEncryption::resolve(
                s3.encryption_options.as_ref(),
                s3.secure,
                self.secrets.as_ref(),
            )
            .await?,
        };
        let client = clients.client(options).await?;
        Ok(S3Driver::new(client)
            .with_region(s3.region.clone())
            .with_transfer(s3.transfer.unwrap_or(self.transfer))
            .with_retry(self.retry.clone())
            .with_classifier(self.classifier.clone()))
    }

    async fn http_driver(&self, http: &HttpArtifact) -> Result<HttpDriver> {
        let mut headers = Vec::with_capacity(http.headers.len());
        for header in &http.headers {
            let value = match &header.value_from {
                Some(selector) => self.secret(selector).await?,
                None => header.value.clone(),
            };
            headers.push((header.name.clone(), value));
        }
        let mut driver = HttpDriver::new(self.http.clone()).with_headers(headers);
        if let Some(auth) = &http.basic_auth {
            driver = driver.with_basic_auth(
                self.secret(&auth.username_secret).await?,
                self.secret(&auth.password_secret).await?,
            );
        }
        Ok(driver)
    }
}

#[cfg(feature = "aws")]
fn default_s3_clients() -> Option<Arc<dyn S3ClientFactory>> {
    Some(Arc::new(crate::objectstore::aws::AwsS3ClientFactory))
}

#[cfg(not(feature = "aws"))]
fn default_s3_clients() -> Option<Arc<dyn S3ClientFactory>> {
    None
}
