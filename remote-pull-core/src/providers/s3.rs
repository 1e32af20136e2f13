//! Amazon S3 (and S3-compatible) provider backed by `aws-sdk-s3`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{entries_from, fetch_each};
use crate::config::{ProviderConfig, ProviderContext};
use crate::contract::{
    DownloadResult, ObjectKind, Provider, ProviderFactory, RemoteClient, RemoteEntry, RemoteObject,
};
use crate::error::{BoxError, DownloadError};

pub const NAME: &str = "s3";
const REQUIRED_KEYS: &[&str] = &["bucket"];
const PAGE_SIZE: i32 = 1000;

/// Builds [`S3Provider`]s. Requires a `region` and a `bucket`.
#[derive(Debug, Default, Clone, Copy)]
pub struct S3Factory;

#[async_trait]
impl ProviderFactory for S3Factory {
    fn name(&self) -> &str {
        NAME
    }

    fn required_config_keys(&self) -> &[&'static str] {
        REQUIRED_KEYS
    }

    fn check_requirements(&self, config: &ProviderConfig) -> Result<(), DownloadError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DownloadError::Requirement {
                provider: NAME.to_string(),
                message: "the S3 client needs a tokio runtime".to_string(),
            });
        }
        if !config.contains("region") {
            return Err(DownloadError::Requirement {
                provider: NAME.to_string(),
                message: "no region configured".to_string(),
            });
        }
        Ok(())
    }

    async fn connect(&self, context: ProviderContext) -> Result<Box<dyn Provider>, DownloadError> {
        let client = S3Client::from_config(&context.config).await?;
        Ok(Box::new(S3Provider::new(context, Arc::new(client))))
    }
}

/// Lists and fetches objects of one bucket under the remote directory prefix.
pub struct S3Provider {
    context: ProviderContext,
    client: Arc<dyn RemoteClient>,
}

impl S3Provider {
    pub fn new(context: ProviderContext, client: Arc<dyn RemoteClient>) -> Self {
        S3Provider { context, client }
    }
}

#[async_trait]
impl Provider for S3Provider {
    fn name(&self) -> &str {
        NAME
    }

    fn context(&self) -> &ProviderContext {
        &self.context
    }

    async fn get_list(&self) -> Result<Vec<RemoteEntry>, DownloadError> {
        let remote_dir = &self.context.remote_dir;
        let prefix = if remote_dir.is_empty() {
            String::new()
        } else {
            format!("{remote_dir}/")
        };
        let objects = self
            .client
            .list(&prefix)
            .await
            .map_err(|e| DownloadError::connection(NAME, e))?;
        let listed = objects.len();
        // Zero-byte objects are directory markers.
        let entries = entries_from(remote_dir, objects, |object| {
            object.kind == ObjectKind::File && object.size > 0
        });
        info!(prefix = %prefix, listed, selected = entries.len(), "[DOWNLOAD] Listed S3 objects");
        Ok(entries)
    }

    async fn perform_download(&self, entries: &[RemoteEntry]) -> DownloadResult {
        fetch_each(&self.context, self.client.as_ref(), entries).await
    }
}

/// [`RemoteClient`] over an S3 bucket.
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        S3Client {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from provider configuration: `region`, `bucket`, and the
    /// optional `access_key_id`, `secret_access_key`, `endpoint_url` and
    /// `force_path_style`. Without static keys the default credential chain is used.
    pub async fn from_config(config: &ProviderConfig) -> Result<Self, DownloadError> {
        let region = config
            .string("region")
            .ok_or_else(|| DownloadError::missing_key(NAME, "region"))?;
        let bucket = config
            .string("bucket")
            .ok_or_else(|| DownloadError::missing_key(NAME, "bucket"))?;
        let force_path_style = config.bool_or("force_path_style", false)?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let (Some(access_key_id), Some(secret_access_key)) = (
            config.string("access_key_id"),
            config.string("secret_access_key"),
        ) {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "remote-pull",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint_url) = config.string("endpoint_url") {
            builder = builder.endpoint_url(endpoint_url);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        debug!(bucket = %bucket, "Created S3 client");
        Ok(S3Client::new(Client::from_conf(builder.build()), bucket))
    }
}

/// One `ListObjectsV2` page: its objects and the token of the next page, if any.
struct Page {
    objects: Vec<RemoteObject>,
    next: Option<String>,
}

fn remote_object(key: &str, size: Option<i64>) -> RemoteObject {
    RemoteObject {
        key: key.to_string(),
        size: u64::try_from(size.unwrap_or(0)).unwrap_or(0),
        kind: if key.ends_with('/') {
            ObjectKind::Directory
        } else {
            ObjectKind::File
        },
    }
}

/// Request pages until one comes back without a continuation token.
async fn collect_pages<F, Fut>(mut fetch_page: F) -> Result<Vec<RemoteObject>, BoxError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page, BoxError>>,
{
    let mut objects = Vec::new();
    let mut token = None;
    loop {
        let page = fetch_page(token.take()).await?;
        objects.extend(page.objects);
        match page.next {
            Some(next) => token = Some(next),
            None => return Ok(objects),
        }
    }
}

#[async_trait]
impl RemoteClient for S3Client {
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BoxError> {
        collect_pages(|token| async move {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(PAGE_SIZE)
                .set_continuation_token(token)
                .send()
                .await?;
            let objects = response
                .contents()
                .iter()
                .filter_map(|object| object.key().map(|key| remote_object(key, object.size())))
                .collect();
            let next = if response.is_truncated().unwrap_or(false) {
                response.next_continuation_token().map(str::to_string)
            } else {
                None
            };
            Ok(Page { objects, next })
        })
        .await
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), BoxError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let mut body = response.body;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = body.try_next().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
