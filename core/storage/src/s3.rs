//! S3-compatible object store client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use fieldsync_common::{Error, Result, SecretKey};

use crate::artifact::S3Artifact;
use crate::auth::{CanonicalRequest, Method, RequestSigner};
use crate::hash::{Clock, SystemClock};
use crate::provider::{normalize_etag, ObjectStore, PutReceipt};

/// Characters left unescaped in an object key segment.
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const HEADER_CONTENT_MD5: &str = "Content-MD5";
const HEADER_ACL: &str = "x-amz-acl";

fn default_endpoint() -> String {
    "https://s3.amazonaws.com".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("fieldsync/{}", env!("CARGO_PKG_VERSION"))
}

/// Connection settings for the object store.
///
/// An empty `secret` can be filled in at runtime, e.g. from a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Service endpoint; the bucket is prepended to its host.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub access_key: String,
    #[serde(default)]
    pub secret: SecretKey,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: default_endpoint(),
            access_key: String::new(),
            secret: SecretKey::default(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, access_key: impl Into<String>, secret: SecretKey) -> Self {
        Self {
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_secret(mut self, secret: SecretKey) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Signed HTTP client for an S3-compatible bucket.
pub struct S3Client {
    http: Client,
    bucket: String,
    base: Url,
    signer: RequestSigner,
    clock: Arc<dyn Clock>,
}

impl S3Client {
    /// Create a client for `config`.
    ///
    /// # Errors
    /// - `Error::Precondition` if the bucket, credentials or endpoint are invalid
    /// - `Error::Network` if the HTTP client cannot be built
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(Error::Precondition("S3 bucket is required".to_string()));
        }
        let signer = RequestSigner::new(config.access_key.clone(), config.secret.clone())?;

        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            Error::Precondition(format!("Invalid endpoint {}: {}", config.endpoint, e))
        })?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| Error::Precondition(format!("Endpoint {} has no host", config.endpoint)))?;
        let mut base = endpoint.clone();
        base.set_host(Some(&format!("{}.{}", config.bucket, host)))
            .map_err(|e| Error::Precondition(format!("Invalid bucket host: {}", e)))?;

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            bucket: config.bucket,
            base,
            signer,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` for request dates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// `https://{bucket}.{endpoint}/{key}`, each key segment percent-encoded.
    pub fn object_url(&self, key: &str) -> Url {
        let path = key
            .trim_start_matches('/')
            .split('/')
            .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        let mut url = self.base.clone();
        url.set_path(&format!("/{}", path));
        url
    }

    /// Headers of a signed upload of `artifact`.
    pub fn put_headers(&self, artifact: &S3Artifact) -> Result<Vec<(&'static str, String)>> {
        let date = self.clock.http_date();
        let request = CanonicalRequest::builder()
            .method(Method::Put)
            .content_md5(artifact.md5_base64())
            .content_type(artifact.content_type)
            .date(date.as_str())
            .public(artifact.is_public())
            .bucket(self.bucket.as_str())
            .key(artifact.key())
            .build()?;

        let mut headers = vec![
            (HEADER_CONTENT_MD5, artifact.md5_base64()),
            (header::CONTENT_TYPE.as_str(), artifact.content_type.to_string()),
            (header::DATE.as_str(), date),
        ];
        if request.is_public() {
            headers.push((HEADER_ACL, "public-read".to_string()));
        }
        headers.push((header::AUTHORIZATION.as_str(), self.signer.authorization(&request)?));
        Ok(headers)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put(&self, artifact: &S3Artifact, data: Bytes) -> Result<PutReceipt> {
        let key = artifact.key();
        let mut request = self.http.put(self.object_url(&key)).body(data);
        for (name, value) in self.put_headers(artifact)? {
            request = request.header(name, value);
        }

        debug!("PUT {} ({})", key, artifact.content_type);
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, "Failed to upload"))?;
        let response = check_status(response).await?;

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .unwrap_or_default();
        info!("Uploaded {}", key);
        Ok(PutReceipt { key, etag })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let date = self.clock.http_date();
        let request = CanonicalRequest::builder()
            .method(Method::Get)
            .date(date.as_str())
            .bucket(self.bucket.as_str())
            .key(key)
            .build()?;

        let response = self
            .http
            .get(self.object_url(request.key()))
            .header(header::DATE, date.as_str())
            .header(header::AUTHORIZATION, self.signer.authorization(&request)?)
            .send()
            .await
            .map_err(|e| transport_error(e, "Failed to download"))?;
        let response = check_status(response).await?;

        response
            .bytes()
            .await
            .map_err(|e| transport_error(e, "Failed to read download response"))
    }
}

/// Unreachable endpoints end the whole sync cycle; other transport
/// failures affect one artifact.
fn transport_error(e: reqwest::Error, context: &str) -> Error {
    if e.is_connect() || e.is_timeout() {
        Error::Connectivity(format!("{}: {}", context, e))
    } else {
        Error::Network(format!("{}: {}", context, e))
    }
}

/// Map a non-success status onto the error taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(format!("S3 object not found: {}", body)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(format!("S3 rejected the request ({}): {}", status, body))
        }
        _ => Error::Network(format!("S3 error: {} - {}", status, body)),
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}
