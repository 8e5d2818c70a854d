use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

/// Object storage holding uploaded order files and their error sidecars.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fails without buffering the rest once the object exceeds `max_bytes`.
    async fn get(&self, bucket: &str, key: &str, max_bytes: u64) -> Result<Vec<u8>>;

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

fn check_size(bucket: &str, key: &str, size: u64, max_bytes: u64) -> Result<()> {
    if size > max_bytes {
        anyhow::bail!("s3://{}/{} is larger than the {} byte limit", bucket, key, max_bytes);
    }
    Ok(())
}

pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    /// Loads credentials from the environment. A custom endpoint switches to
    /// path-style addressing for MinIO and LocalStack.
    pub async fn connect(endpoint: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        let client = match endpoint {
            Some(endpoint) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&config)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&config),
        };

        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, bucket: &str, key: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch s3://{}/{}: {}", bucket, key, DisplayErrorContext(&e)))?;

        if let Some(length) = response.content_length() {
            check_size(bucket, key, u64::try_from(length).unwrap_or(0), max_bytes)?;
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .body
            .try_next()
            .await
            .map_err(|e| anyhow!("Failed to read s3://{}/{}: {}", bucket, key, e))?
        {
            check_size(bucket, key, (body.len() + chunk.len()) as u64, max_bytes)?;
            body.extend_from_slice(&chunk);
        }

        debug!(bucket, key, size = body.len(), "Fetched object");
        Ok(body)
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("text/csv")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to write s3://{}/{}: {}", bucket, key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map_or(false, |se| se.is_not_found()) => Ok(false),
            Err(e) => Err(anyhow!(
                "Failed to check s3://{}/{}: {}",
                bucket,
                key,
                DisplayErrorContext(&e)
            )),
        }
    }
}
