//! Request signing for the object store.
//!
//! Requests carry an `Authorization: AWS {access_key}:{signature}` header.
//! The signature is Base64(HMAC-SHA1) keyed with the shared secret over a
//! canonical payload of newline-joined fields:
//!
//! ```text
//! PUT\n{content_md5}\n{content_type}\n{date}\n[x-amz-acl:public-read\n]/{bucket}/{key}
//! GET\n\n\n{date}\n/{bucket}/{key}
//! ```
//!
//! The ACL line is present only for public uploads.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use fieldsync_common::{Error, Result, SecretKey};

type HmacSha1 = Hmac<Sha1>;

/// Canonical header line granting public read access.
pub const ACL_PUBLIC_READ: &str = "x-amz-acl:public-read";

/// HTTP method of a signed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Put,
    Get,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Put => "PUT",
            Method::Get => "GET",
        }
    }
}

/// A request reduced to the fields covered by the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    method: Method,
    content_md5: String,
    content_type: String,
    date: String,
    public: bool,
    bucket: String,
    key: String,
}

impl CanonicalRequest {
    pub fn builder() -> CanonicalRequestBuilder {
        CanonicalRequestBuilder::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Object key without a leading slash.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    /// The string that gets signed.
    pub fn payload(&self) -> String {
        match self.method {
            Method::Put => {
                let acl = if self.public {
                    format!("{}\n", ACL_PUBLIC_READ)
                } else {
                    String::new()
                };
                format!(
                    "PUT\n{}\n{}\n{}\n{}/{}/{}",
                    self.content_md5, self.content_type, self.date, acl, self.bucket, self.key
                )
            }
            Method::Get => format!("GET\n\n\n{}\n/{}/{}", self.date, self.bucket, self.key),
        }
    }
}

/// Builder for [`CanonicalRequest`].
///
/// # Errors
/// [`CanonicalRequestBuilder::build`] fails with `Error::Precondition` when
/// the method, bucket, key or date is missing, or when a PUT lacks its
/// content hash or content type.
#[derive(Debug, Default)]
pub struct CanonicalRequestBuilder {
    method: Option<Method>,
    content_md5: Option<String>,
    content_type: Option<String>,
    date: Option<String>,
    public: bool,
    bucket: Option<String>,
    key: Option<String>,
}

impl CanonicalRequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Base64 MD5 of the body.
    pub fn content_md5(mut self, md5: impl Into<String>) -> Self {
        self.content_md5 = Some(md5.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Object key. A leading slash is dropped so the payload never holds `//`.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn build(self) -> Result<CanonicalRequest> {
        let method = self
            .method
            .ok_or_else(|| Error::Precondition("Request method is required".to_string()))?;
        let bucket = required(self.bucket, "bucket")?;
        let key = required(self.key, "object key")?;
        let key = key.trim_start_matches('/').to_string();
        if key.is_empty() {
            return Err(Error::Precondition("object key is required".to_string()));
        }
        let date = required(self.date, "date")?;

        let (content_md5, content_type) = match method {
            Method::Put => (
                required(self.content_md5, "content MD5")?,
                required(self.content_type, "content type")?,
            ),
            Method::Get => (String::new(), String::new()),
        };

        Ok(CanonicalRequest {
            method,
            content_md5,
            content_type,
            date,
            public: method == Method::Put && self.public,
            bucket,
            key,
        })
    }
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Precondition(format!("{} is required", what))),
    }
}

/// Signs canonical requests with the shared secret.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    access_key: String,
    secret: SecretKey,
}

impl RequestSigner {
    /// # Errors
    /// - `Error::Precondition` if the access key or secret is empty
    pub fn new(access_key: impl Into<String>, secret: SecretKey) -> Result<Self> {
        let access_key = access_key.into();
        if access_key.trim().is_empty() || secret.is_empty() {
            return Err(Error::Precondition(
                "Access key and secret are required".to_string(),
            ));
        }
        Ok(Self { access_key, secret })
    }

    /// Base64(HMAC-SHA1(secret, payload)).
    pub fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Precondition(format!("Invalid signing key: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Value of the `Authorization` header for `request`.
    pub fn authorization(&self, request: &CanonicalRequest) -> Result<String> {
        Ok(format!(
            "AWS {}:{}",
            self.access_key,
            self.sign(&request.payload())?
        ))
    }
}
