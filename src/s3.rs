//! Utility functions for creating s3 clients and addressing s3 objects
use anyhow::{anyhow, Result};
use aws_sdk_s3::config::Region;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::operation::head_bucket::HeadBucketOutput;
use aws_sdk_s3::operation::put_object::PutObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use regex::Regex;

pub async fn client_from_profile(profile_name: &str, region: &str) -> Client {
    let base_config = aws_config::from_env()
        .profile_name(profile_name)
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&base_config)
        .region(Region::new(region.to_owned()))
        .build();

    Client::from_conf(s3_config)
}

pub async fn anon_client(region: &str) -> Client {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .no_credentials()
        .region(Region::new(region.to_owned()))
        .load()
        .await;
    Client::new(&config)
}

pub trait S3ObjOps {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<PutObjectOutput>;

    async fn head_bucket(&self, bucket: &str) -> Result<HeadBucketOutput>;

    /// Fetch a whole object into memory.
    async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let object = self.get_object(bucket, key).await?;
        let data = object.body.collect().await?.to_vec();
        Ok(data)
    }
}

pub struct Provider {
    client: Client,
}

impl Provider {
    pub async fn from_profile(profile_name: &str, region: &str) -> Self {
        let client = client_from_profile(profile_name, region).await;
        Self { client }
    }

    pub async fn as_anon(region: &str) -> Self {
        let client = anon_client(region).await;
        Self { client }
    }
}

impl S3ObjOps for Provider {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(object)
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<PutObjectOutput> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("image/tiff")
            .body(ByteStream::from(body))
            .send()
            .await?;
        Ok(output)
    }

    async fn head_bucket(&self, bucket: &str) -> Result<HeadBucketOutput> {
        let head = self.client.head_bucket().bucket(bucket).send().await?;
        Ok(head)
    }
}

#[derive(Debug, PartialEq)]
pub struct S3Location {
    pub bucket: String,
    pub region: Option<String>,
    pub key: String,
}

impl S3Location {
    /// Parse an `s3://bucket/key` URL or a virtual-hosted
    /// `https://bucket.s3.region.amazonaws.com/key` URL. Anything else is not
    /// an s3 location.
    pub fn from_href(href: &str) -> Result<Self> {
        if let Some(rest) = href.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or(anyhow!("No key in s3 url: {}", href))?;
            return Ok(Self {
                bucket: bucket.to_string(),
                region: None,
                key: key.to_string(),
            });
        }

        let re = Regex::new(
            r"https://(?<bucket>[^.]+)\.s3\.(?<region>[^.]+)\.amazonaws\.com/(?<key>.+)",
        )?;

        let captures = re
            .captures(href)
            .ok_or(anyhow!("No regex matches found for: {}", href))?;

        let (_, [bucket, region, key]) = captures.extract();
        Ok(Self {
            bucket: bucket.to_string(),
            region: Some(region.to_string()),
            key: key.to_string(),
        })
    }

    /// False when the href names a region other than `region`; such objects
    /// cannot be read with a client bound to `region`.
    pub fn is_in_region(&self, region: &str) -> bool {
        self.region.as_deref().map_or(true, |r| r == region)
    }
}
