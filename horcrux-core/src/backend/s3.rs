//! S3 and Minio-compatible object-storage backends. Both wrap an
//! `aws-sdk-s3` client; `init` builds it once and `get` drives it from a
//! dedicated single-thread Tokio runtime, since the rest of the crate (and
//! the FUSE adapter above it) is synchronous.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::{cleanup_partial, Backend};
use crate::error::{Error, Result};

const MINIO_KEY_FILE: &str = ".minio/horcrux.json";

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime for object-storage backend")
        .block_on(fut)
}

async fn download(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    src: &str,
    dst: &Path,
) -> std::result::Result<(), anyhow::Error> {
    let mut object = client
        .get_object()
        .bucket(bucket)
        .key(src)
        .send()
        .await?;

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(dst)?;
    while let Some(chunk) = object.body.try_next().await? {
        out.write_all(&chunk)?;
    }
    Ok(())
}

pub struct S3Backend {
    bucket: String,
    region: String,
    client: Option<aws_sdk_s3::Client>,
}

impl S3Backend {
    /// Parse `<bucket>@<region>`.
    pub fn parse(args: &str) -> Result<Self> {
        let idx = args
            .find('@')
            .filter(|&i| i != 0)
            .ok_or_else(|| Error::InvalidArgument(format!("bad s3 access spec: {args}")))?;
        Ok(Self {
            bucket: args[..idx].to_string(),
            region: args[idx + 1..].to_string(),
            client: None,
        })
    }
}

impl Backend for S3Backend {
    fn init(&mut self) -> Result<Option<String>> {
        debug!(bucket = %self.bucket, region = %self.region, "s3 backend init");
        let region = self.region.clone();
        let config = block_on(async {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(region))
                .load()
                .await
        });
        self.client = Some(aws_sdk_s3::Client::new(&config));
        Ok(None)
    }

    fn name(&self) -> &str {
        "s3"
    }

    fn get(&self, src: &str, dst: &Path) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::AuthError("s3 backend not initialized".into()))?;
        if let Err(e) = block_on(download(client, &self.bucket, src, dst)) {
            cleanup_partial(dst);
            return Err(Error::io(dst, std::io::Error::other(e)));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct MinioKey {
    #[serde(rename = "accessKeyId")]
    access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    secret_access_key: String,
}

/// Minio speaks the S3 wire protocol, so this is an `S3Backend` pointed at a
/// custom endpoint with credentials read from `~/.minio/horcrux.json`
/// instead of the ambient AWS credential chain.
pub struct MinioBackend {
    endpoint: String,
    bucket: String,
    client: Option<aws_sdk_s3::Client>,
}

impl MinioBackend {
    /// Parse `<host[:port]>/<bucket>`.
    pub fn parse(args: &str) -> Result<Self> {
        let idx = args
            .find('/')
            .ok_or_else(|| Error::InvalidArgument(format!("bad minio access spec: {args}")))?;
        Ok(Self {
            endpoint: format!("http://{}", &args[..idx]),
            bucket: args[idx + 1..].to_string(),
            client: None,
        })
    }
}

impl Backend for MinioBackend {
    fn init(&mut self) -> Result<Option<String>> {
        debug!(endpoint = %self.endpoint, bucket = %self.bucket, "minio backend init");

        let home = dirs::home_dir()
            .ok_or_else(|| Error::AuthError("cannot determine home directory".into()))?;
        let key_path = home.join(MINIO_KEY_FILE);
        let key_data = std::fs::read_to_string(&key_path).map_err(|e| Error::io(&key_path, e))?;
        let key: MinioKey = serde_json::from_str(&key_data)
            .map_err(|e| Error::AuthError(format!("cannot parse {}: {e}", key_path.display())))?;

        let credentials = aws_sdk_s3::config::Credentials::new(
            key.access_key_id,
            key.secret_access_key,
            None,
            None,
            "horcrux-minio",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .endpoint_url(&self.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        self.client = Some(aws_sdk_s3::Client::from_conf(config));
        Ok(None)
    }

    fn name(&self) -> &str {
        "minio"
    }

    fn get(&self, src: &str, dst: &Path) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::AuthError("minio backend not initialized".into()))?;
        if let Err(e) = block_on(download(client, &self.bucket, src, dst)) {
            cleanup_partial(dst);
            return Err(Error::io(dst, std::io::Error::other(e)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_parse_splits_bucket_and_region() {
        let b = S3Backend::parse("my-bucket@us-west-2").unwrap();
        assert_eq!(b.bucket, "my-bucket");
        assert_eq!(b.region, "us-west-2");
    }

    #[test]
    fn s3_parse_rejects_missing_at() {
        assert!(S3Backend::parse("my-bucket").is_err());
    }

    #[test]
    fn minio_parse_splits_endpoint_and_bucket() {
        let b = MinioBackend::parse("minio.local:9000/my-bucket").unwrap();
        assert_eq!(b.endpoint, "http://minio.local:9000");
        assert_eq!(b.bucket, "my-bucket");
    }

    #[test]
    fn minio_parse_rejects_missing_slash() {
        assert!(MinioBackend::parse("minio.local:9000").is_err());
    }
}
