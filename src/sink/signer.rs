use base64::prelude::{Engine as _, BASE64_STANDARD};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Headers covered by the signature of a request with a body, in order.
const SIGNED_BODY_HEADERS: [&str; 6] = [
    "date",
    "(request-target)",
    "host",
    "x-content-sha256",
    "content-type",
    "content-length",
];

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid private key: {0}")]
    Key(openssl::error::ErrorStack),

    #[error("failed to sign request: {0}")]
    Sign(openssl::error::ErrorStack),

    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Values to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub date: String,
    pub host: String,
    pub content_sha256: String,
    pub content_type: &'static str,
    pub content_length: usize,
    pub authorization: String,
}

/// Signs OCI API requests with an API signing key (RSA-SHA256).
///
/// The signing string is built from the headers in [`SIGNED_BODY_HEADERS`],
/// one `name: value` line each, and the key id is
/// `<tenancy>/<user>/<fingerprint>`.
pub struct RequestSigner {
    key_id: String,
    key: PKey<Private>,
}

impl RequestSigner {
    pub fn new(
        tenancy_ocid: &str,
        user_ocid: &str,
        fingerprint: &str,
        private_key_pem: &str,
        passphrase: Option<&str>,
    ) -> Result<Self, SignerError> {
        let key = match passphrase.filter(|p| !p.is_empty()) {
            Some(pass) => {
                PKey::private_key_from_pem_passphrase(private_key_pem.as_bytes(), pass.as_bytes())
            }
            None => PKey::private_key_from_pem(private_key_pem.as_bytes()),
        }
        .map_err(SignerError::Key)?;

        Ok(Self {
            key_id: format!("{tenancy_ocid}/{user_ocid}/{fingerprint}"),
            key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign a POST of `body` to `url`; `date` must be an RFC 7231 timestamp.
    pub fn sign_post(&self, url: &Url, body: &[u8], date: &str) -> Result<SignedHeaders, SignerError> {
        let host = host_header(url)?;
        let content_sha256 = BASE64_STANDARD.encode(Sha256::digest(body));
        let content_length = body.len();

        let signing_string = signing_string(
            &request_target("post", url),
            date,
            &host,
            &content_sha256,
            JSON_CONTENT_TYPE,
            content_length,
        );
        let signature = self.sign(signing_string.as_bytes())?;

        let authorization = format!(
            "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            SIGNED_BODY_HEADERS.join(" "),
            signature
        );

        Ok(SignedHeaders {
            date: date.to_string(),
            host,
            content_sha256,
            content_type: JSON_CONTENT_TYPE,
            content_length,
            authorization,
        })
    }

    fn sign(&self, data: &[u8]) -> Result<String, SignerError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key).map_err(SignerError::Sign)?;
        signer.update(data).map_err(SignerError::Sign)?;
        let signature = signer.sign_to_vec().map_err(SignerError::Sign)?;
        Ok(BASE64_STANDARD.encode(signature))
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

fn host_header(url: &Url) -> Result<String, SignerError> {
    let host = url
        .host_str()
        .ok_or_else(|| SignerError::MissingHost(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn request_target(method: &str, url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{} {}?{}", method, url.path(), query),
        None => format!("{} {}", method, url.path()),
    }
}

fn signing_string(
    request_target: &str,
    date: &str,
    host: &str,
    content_sha256: &str,
    content_type: &str,
    content_length: usize,
) -> String {
    [
        format!("date: {date}"),
        format!("(request-target): {request_target}"),
        format!("host: {host}"),
        format!("x-content-sha256: {content_sha256}"),
        format!("content-type: {content_type}"),
        format!("content-length: {content_length}"),
    ]
    .join("\n")
}
