//! Request signing capability.
//!
//! The protocol engine only depends on the [`Signer`] trait. [`Snws2Signer`]
//! builds the SolarNetwork V2 canonical request and delegates the HMAC-SHA256
//! primitive to the `hmac`/`sha2` crates.
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::time::SystemTime;

use crate::time_sync::{TimeSync, format_day_stamp, format_http_date, format_iso_basic, unix_millis};

type HmacSha256 = Hmac<Sha256>;

pub const SCHEME: &str = "SNWS2";
const ALGORITHM: &str = "SNWS2-HMAC-SHA256";
const REQUEST_SUFFIX: &str = "snws2_request";

/// Form encoding used by instruction-queue requests.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Authorization header value plus the date it was computed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAuthorization {
    pub header: String,
    /// RFC 1123 value for the `X-SN-Date` header.
    pub date_header: String,
    pub date_millis: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum SignError {
    #[error("cannot sign invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signing key rejected")]
    Key,
}

pub trait Signer {
    fn token_id(&self) -> &str;

    /// Compute an authorization for `method url` as if it were sent now.
    fn sign(
        &self,
        method: HttpMethod,
        url: &str,
        content_type: Option<&str>,
    ) -> Result<SignedAuthorization, SignError>;
}

pub struct Snws2Signer {
    token_id: String,
    secret: String,
    clock: TimeSync,
}

impl Snws2Signer {
    pub fn new(token_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            secret: secret.into(),
            clock: TimeSync::new(),
        }
    }

    pub fn with_clock(mut self, clock: TimeSync) -> Self {
        self.clock = clock;
        self
    }

    pub fn sign_at(
        &self,
        method: HttpMethod,
        url: &str,
        content_type: Option<&str>,
        date: SystemTime,
    ) -> Result<SignedAuthorization, SignError> {
        let parsed = Url::parse(url).map_err(|e| SignError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let date_header = format_http_date(date);
        let headers = canonical_headers(&parsed, &date_header, content_type).ok_or_else(|| {
            SignError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            }
        })?;
        let signed_names: Vec<&str> = headers.iter().map(|(name, _)| *name).collect();
        let canonical = canonical_request(method, &parsed, &headers);

        let string_to_sign = format!(
            "{}\n{}\n{}",
            ALGORITHM,
            format_iso_basic(date),
            hex::encode(Sha256::digest(canonical.as_bytes()))
        );
        let signing_key = self.signing_key(date)?;
        let signature = hmac_sha256(&signing_key, string_to_sign.as_bytes())?;

        Ok(SignedAuthorization {
            header: format!(
                "{} Credential={},SignedHeaders={},Signature={}",
                SCHEME,
                self.token_id,
                signed_names.join(";"),
                hex::encode(signature)
            ),
            date_header,
            date_millis: unix_millis(date),
        })
    }

    fn signing_key(&self, date: SystemTime) -> Result<Vec<u8>, SignError> {
        let secret = format!("{}{}", SCHEME, self.secret);
        let day_key = hmac_sha256(secret.as_bytes(), format_day_stamp(date).as_bytes())?;
        hmac_sha256(&day_key, REQUEST_SUFFIX.as_bytes())
    }
}

impl Signer for Snws2Signer {
    fn token_id(&self) -> &str {
        &self.token_id
    }

    fn sign(
        &self,
        method: HttpMethod,
        url: &str,
        content_type: Option<&str>,
    ) -> Result<SignedAuthorization, SignError> {
        self.sign_at(method, url, content_type, self.clock.now())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| SignError::Key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Signed headers, sorted by name.
fn canonical_headers(
    url: &Url,
    date_header: &str,
    content_type: Option<&str>,
) -> Option<Vec<(&'static str, String)>> {
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return None,
    };
    let mut headers = Vec::with_capacity(3);
    if let Some(ct) = content_type {
        headers.push(("content-type", ct.to_string()));
    }
    headers.push(("host", host));
    headers.push(("x-sn-date", date_header.to_string()));
    Some(headers)
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_request(method: HttpMethod, url: &Url, headers: &[(&'static str, String)]) -> String {
    let mut out = String::new();
    out.push_str(method.as_str());
    out.push('\n');
    out.push_str(url.path());
    out.push('\n');
    out.push_str(&canonical_query(url));
    out.push('\n');
    for (name, value) in headers {
        out.push_str(name);
        out.push(':');
        out.push_str(value.trim());
        out.push('\n');
    }
    let names: Vec<&str> = headers.iter().map(|(name, _)| *name).collect();
    out.push_str(&names.join(";"));
    out.push('\n');
    // Every signed request carries an empty body.
    out.push_str(&hex::encode(Sha256::digest(b"")));
    out
}
