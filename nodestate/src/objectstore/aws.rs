//! S3 client backed by the AWS SDK.

use super::encryption::ServerSideEncryption;
use super::keys::directory_prefix;
use super::upload::AbortOnDrop;
use super::{S3Client, S3ClientFactory, S3ClientOptions};
use crate::errors::{NodeStateError, RemoteError, Result};
use crate::substrate::ByteStream;
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    ServerSideEncryption as SdkSse,
};
use aws_sdk_s3::Client;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use std::path::Path;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const PART_BYTES: usize = 16 * 1024 * 1024;
const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound", "NoSuchUpload"];

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, what: &str) -> NodeStateError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => NodeStateError::remote("RequestTimeout", format!("{what}: timed out")),
        SdkError::DispatchFailure(failure) => {
            NodeStateError::remote("RequestError", format!("{what}: {failure:?}"))
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or("Unknown").to_string();
            if status == 404 || NOT_FOUND_CODES.contains(&code.as_str()) {
                return NodeStateError::not_found(what.to_string());
            }
            let message = ctx.err().message().unwrap_or_default().to_string();
            RemoteError::new(code, format!("{what}: {message}"))
                .with_status(status)
                .into()
        }
        _ => NodeStateError::remote("RequestError", format!("{what}: {err}")),
    }
}

async fn abort_upload(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    if let Err(abort) = client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
    {
        warn!(bucket = %bucket, key = %key, error = %abort, "Abort of multipart upload failed");
    }
}

/// An [`S3Client`] over the AWS SDK, with path-style addressing so that any
/// S3-compatible endpoint works.
#[derive(Debug, Clone)]
pub struct AwsS3Client {
    client: Client,
    encryption: Option<ServerSideEncryption>,
}

impl AwsS3Client {
    /// Builds a client from resolved options.
    #[must_use]
    pub fn new(options: &S3ClientOptions) -> Self {
        let scheme = if options.secure { "https" } else { "http" };
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(options.region.clone().unwrap_or_else(|| "us-east-1".to_string())))
            .force_path_style(true);
        if !options.endpoint.is_empty() {
            builder = builder.endpoint_url(format!("{scheme}://{}", options.endpoint));
        }
        if let (Some(access), Some(secret)) = (&options.access_key, &options.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access.clone(),
                secret.clone(),
                options.session_token.clone(),
                None,
                "nodestate",
            ));
        }
        Self {
            client: Client::from_conf(builder.build()),
            encryption: options.encryption.clone(),
        }
    }

    fn customer_key(&self) -> Option<(String, String)> {
        match &self.encryption {
            Some(ServerSideEncryption::CustomerKey(key)) => {
                Some((STANDARD.encode(key), STANDARD.encode(Md5::digest(key))))
            }
            _ => None,
        }
    }

    fn kms_context(context: &std::collections::BTreeMap<String, String>) -> Option<String> {
        if context.is_empty() {
            return None;
        }
        serde_json::to_vec(context).ok().map(|json| STANDARD.encode(json))
    }

    async fn put_bytes(&self, bucket: &str, key: &str, body: SdkByteStream) -> Result<()> {
        let mut request = self.client.put_object().bucket(bucket).key(key).body(body);
        match &self.encryption {
            Some(ServerSideEncryption::S3) => request = request.server_side_encryption(SdkSse::Aes256),
            Some(ServerSideEncryption::Kms { key_id, context }) => {
                request = request
                    .server_side_encryption(SdkSse::AwsKms)
                    .ssekms_key_id(key_id)
                    .set_ssekms_encryption_context(Self::kms_context(context));
            }
            Some(ServerSideEncryption::CustomerKey(_)) | None => {}
        }
        if let Some((key64, md5)) = self.customer_key() {
            request = request
                .sse_customer_algorithm("AES256")
                .sse_customer_key(key64)
                .sse_customer_key_md5(md5);
        }
        request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("put s3://{bucket}/{key}")))?;
        Ok(())
    }

    async fn upload_part(&self, bucket: &str, key: &str, upload_id: &str, number: i32, part: Bytes) -> Result<CompletedPart> {
        let mut request = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(SdkByteStream::from(part));
        if let Some((key64, md5)) = self.customer_key() {
            request = request
                .sse_customer_algorithm("AES256")
                .sse_customer_key(key64)
                .sse_customer_key_md5(md5);
        }
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("upload part {number} of s3://{bucket}/{key}")))?;
        Ok(CompletedPart::builder()
            .part_number(number)
            .set_e_tag(output.e_tag().map(str::to_string))
            .build())
    }

    async fn multipart(&self, bucket: &str, key: &str, upload_id: &str, mut data: ByteStream) -> Result<()> {
        let mut parts = Vec::new();
        let mut buffer = BytesMut::new();
        let mut number = 1;
        while let Some(chunk) = data.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= PART_BYTES {
                let part = buffer.split_to(PART_BYTES).freeze();
                parts.push(self.upload_part(bucket, key, upload_id, number, part).await?);
                number += 1;
            }
        }
        if !buffer.is_empty() || parts.is_empty() {
            parts.push(self.upload_part(bucket, key, upload_id, number, buffer.freeze()).await?);
        }
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("complete upload of s3://{bucket}/{key}")))?;
        Ok(())
    }
}

#[async_trait]
impl S3Client for AwsS3Client {
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = SdkByteStream::from_path(path)
            .await
            .map_err(|e| NodeStateError::permanent(format!("read {}: {e}", path.display())))?;
        self.put_bytes(bucket, key, body).await
    }

    async fn put_stream(&self, bucket: &str, key: &str, data: ByteStream, size: Option<u64>) -> Result<()> {
        if let Some(size) = size.filter(|s| usize::try_from(*s).is_ok_and(|s| s <= PART_BYTES)) {
            let bytes: Vec<Bytes> = data.try_collect().await?;
            let body: Bytes = bytes.concat().into();
            debug!(bucket = %bucket, key = %key, size, "Uploading stream in one request");
            return self.put_bytes(bucket, key, SdkByteStream::from(body)).await;
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("start upload of s3://{bucket}/{key}")))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| NodeStateError::permanent("multipart upload returned no upload id"))?
            .to_string();

        // Dropping this future mid-upload still releases the uploaded parts.
        let guard = AbortOnDrop::new({
            let client = self.client.clone();
            let (bucket, key, upload_id) = (bucket.to_string(), key.to_string(), upload_id.clone());
            move || match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { abort_upload(&client, &bucket, &key, &upload_id).await });
                }
                Err(_) => warn!(bucket = %bucket, key = %key, "No runtime to abort multipart upload"),
            }
        });
        let result = self.multipart(bucket, key, &upload_id, data).await;
        guard.disarm();
        if let Err(err) = result {
            warn!(bucket = %bucket, key = %key, error = %err, "Aborting multipart upload");
            abort_upload(&self.client, bucket, key, &upload_id).await;
            return Err(err);
        }
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let mut stream = self.open_file(bucket, key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = stream.next().await {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk?).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }

    async fn open_file(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some((key64, md5)) = self.customer_key() {
            request = request
                .sse_customer_algorithm("AES256")
                .sse_customer_key(key64)
                .sse_customer_key_md5(md5);
        }
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("s3://{bucket}/{key}")))?;
        let reader = output.body.into_async_read();
        Ok(ReaderStream::new(reader).map_err(NodeStateError::from).boxed())
    }

    async fn key_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = map_sdk_error(e, &format!("s3://{bucket}/{key}"));
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("delete s3://{bucket}/{key}")))?;
        Ok(())
    }

    async fn list_directory(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = directory_prefix(prefix);
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(&dir)
            .into_paginator()
            .send();
        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_error(e, &format!("list s3://{bucket}/{dir}")))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .filter(|k| !k.ends_with('/'))
                    .map(str::to_string),
            );
        }
        Ok(keys)
    }

    async fn is_directory(&self, bucket: &str, prefix: &str) -> Result<bool> {
        let dir = directory_prefix(prefix);
        let page = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(&dir)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("list s3://{bucket}/{dir}")))?;
        Ok(page.key_count().unwrap_or(0) > 0)
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = map_sdk_error(e, &format!("bucket {bucket}"));
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn make_bucket(&self, bucket: &str, region: Option<String>) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if let Some(region) = region.filter(|r| r != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("create bucket {bucket}")))?;
        Ok(())
    }
}

/// Builds an [`AwsS3Client`] per resolved option set.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsS3ClientFactory;

#[async_trait]
impl S3ClientFactory for AwsS3ClientFactory {
    async fn client(&self, options: S3ClientOptions) -> Result<Arc<dyn S3Client>> {
        Ok(Arc::new(AwsS3Client::new(&options)))
    }
}
