//! S3-compatible object store over the REST API with SigV4 request signing.

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::{
    build_http_client, classify_reqwest_error, classify_status, sha256_hex, HttpClientConfig,
    ObjectStore, ObjectStoreError, RetryDisposition,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// MinIO, LocalStack and friends; switches to path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl S3Credentials {
    /// Loads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectLocation {
    url: String,
    host: String,
    canonical_uri: String,
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    config: S3Config,
    credentials: S3Credentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(config: S3Config, credentials: S3Credentials, http: &HttpClientConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            anyhow::bail!("s3 bucket name is empty");
        }
        Ok(Self {
            config,
            credentials,
            client: build_http_client(http)?,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn location(&self, key: &str) -> ObjectLocation {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.config.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") { "http" } else { "https" };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                let canonical_uri = format!("/{}/{}", uri_encode(&self.config.bucket), encoded_key);
                ObjectLocation {
                    url: format!("{scheme}://{host}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.config.bucket, self.config.region);
                let canonical_uri = format!("/{encoded_key}");
                ObjectLocation {
                    url: format!("https://{host}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    /// Headers to attach to the request, `authorization` included; `host` is left to the client.
    fn signed_headers(
        &self,
        method: &Method,
        location: &ObjectLocation,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host", location.host.clone()),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", amz_date.clone()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(b.0));

        let signed_header_names = headers.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let canonical_request = format!(
            "{method}\n{}\n\n{canonical_headers}\n{signed_header_names}\n{payload_hash}",
            location.canonical_uri
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.credentials.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        headers.retain(|(k, _)| *k != "host");
        headers.push((
            "authorization",
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_header_names}, Signature={signature}",
                self.credentials.access_key_id
            ),
        ));
        headers
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        if key.is_empty() {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        let location = self.location(key);
        let payload_hash = sha256_hex(body.as_deref().unwrap_or_default());

        let mut request = self.client.request(method.clone(), &location.url);
        for (name, value) in self.signed_headers(&method, &location, &payload_hash, Utc::now()) {
            request = request.header(name, value);
        }
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        request.send().await.map_err(|err| {
            let reason = format!("{method} s3://{}/{key}: {err}", self.config.bucket);
            match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => ObjectStoreError::Transient(reason),
                RetryDisposition::NonRetryable => ObjectStoreError::Rejected(reason),
            }
        })
    }

    fn status_failure(&self, method: &str, key: &str, status: StatusCode) -> ObjectStoreError {
        let reason = format!(
            "S3 {method} failed (HTTP {status}) for s3://{}/{key}",
            self.config.bucket
        );
        match classify_status(status) {
            RetryDisposition::Retryable => ObjectStoreError::Transient(reason),
            RetryDisposition::NonRetryable => ObjectStoreError::Rejected(reason),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        let bytes = body.len();
        let resp = self.send(Method::PUT, key, Some(body), content_type).await?;
        if !resp.status().is_success() {
            return Err(self.status_failure("PutObject", key, resp.status()));
        }
        debug!(bucket = %self.config.bucket, key, content_type = ?content_type, bytes, "object stored in s3");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let resp = self.send(Method::GET, key, None, None).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(key.to_string())),
            status if status.is_success() => resp
                .bytes()
                .await
                .map(|body| body.to_vec())
                .map_err(|err| ObjectStoreError::Transient(format!("reading s3 object {key}: {err}"))),
            status => Err(self.status_failure("GetObject", key, status)),
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let resp = self.send(Method::HEAD, key, None, None).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(self.status_failure("HeadObject", key, status)),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 unreserved characters pass through; everything else is `%XX` upper-case.
fn uri_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}
