//! AWS SigV4 query-string presigning for S3-compatible endpoints.
//!
//! Used both to hand out object links and to authenticate the agent's own listing and
//! bucket-configuration calls, so the only credential material on the wire is the signature.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{AccessError, AccessResult};

pub const ALGORITHM_IDENTIFIER: &str = "AWS4-HMAC-SHA256";
pub const KEY_TYPE_IDENTIFIER: &str = "aws4_request";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
pub const ALGORITHM_QUERY_PARAM: &str = "X-Amz-Algorithm";
pub const CREDENTIAL_QUERY_PARAM: &str = "X-Amz-Credential";
pub const AMZ_DATE_QUERY_PARAM: &str = "X-Amz-Date";
pub const EXPIRES_QUERY_PARAM: &str = "X-Amz-Expires";
pub const SIGNED_HEADERS_QUERY_PARAM: &str = "X-Amz-SignedHeaders";
pub const AMZ_SECURITY_TOKEN_QUERY_PARAM: &str = "X-Amz-Security-Token";
pub const AMZ_SIGNATURE_QUERY_PARAM: &str = "X-Amz-Signature";
/// SigV4 presigned URLs cannot outlive seven days.
pub const MAX_EXPIRES_SECS: u64 = 7 * 24 * 3600;

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("access_key_id", &self.access_key_id).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// `https://host/bucket/key`
    Path,
    /// `https://bucket.host/key`
    VirtualHost,
}

#[derive(Debug, Clone)]
pub struct SignOptions {
    pub method: String,
    pub bucket: String,
    pub key: String,
    /// Extra query parameters that become part of the signed request.
    pub query: Vec<(String, String)>,
    pub expires: u64,
    pub region: String,
    pub service: String,
    pub addressing: Addressing,
    pub time: Option<DateTime<Utc>>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            bucket: String::new(),
            key: String::new(),
            query: Vec::new(),
            expires: 3600,
            region: "us-east-1".to_string(),
            service: "s3".to_string(),
            addressing: Addressing::Path,
            time: None,
        }
    }
}

/// Produce a presigned URL for `options` against `endpoint` (scheme, host, optional port and
/// path prefix are taken from it).
pub fn presign_url(endpoint: &Url, credentials: &Credentials, options: &SignOptions) -> AccessResult<String> {
    if options.expires == 0 || options.expires > MAX_EXPIRES_SECS {
        return Err(AccessError::InvalidConfig(format!(
            "presign expiry of {}s is outside 1..={}s", options.expires, MAX_EXPIRES_SECS
        )));
    }
    let host_name = endpoint
        .host_str()
        .ok_or_else(|| AccessError::InvalidConfig(format!("endpoint '{}' has no host", endpoint)))?;
    let mut host = match options.addressing {
        Addressing::VirtualHost if !options.bucket.is_empty() => format!("{}.{}", options.bucket, host_name),
        _ => host_name.to_string(),
    };
    if let Some(port) = endpoint.port() {
        host = format!("{}:{}", host, port);
    }

    let mut path = endpoint.path().trim_end_matches('/').to_string();
    if options.addressing == Addressing::Path && !options.bucket.is_empty() {
        path.push('/');
        path.push_str(&uri_encode(&options.bucket, true));
    }
    if !options.key.is_empty() {
        path.push('/');
        path.push_str(&uri_encode(&options.key, false));
    }
    if path.is_empty() {
        path.push('/');
    }

    let datetime = options.time.unwrap_or_else(Utc::now);
    let amz_date = datetime.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = derive_scope(&amz_date, &options.region, &options.service);

    let mut params: Vec<(String, String)> = options.query.clone();
    params.push((ALGORITHM_QUERY_PARAM.into(), ALGORITHM_IDENTIFIER.into()));
    params.push((CREDENTIAL_QUERY_PARAM.into(), format!("{}/{}", credentials.access_key_id, scope)));
    params.push((AMZ_DATE_QUERY_PARAM.into(), amz_date.clone()));
    params.push((EXPIRES_QUERY_PARAM.into(), options.expires.to_string()));
    if let Some(token) = &credentials.session_token {
        params.push((AMZ_SECURITY_TOKEN_QUERY_PARAM.into(), token.clone()));
    }
    params.push((SIGNED_HEADERS_QUERY_PARAM.into(), "host".into()));
    let canonical_query = canonical_query_string(&params);

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
        options.method, path, canonical_query, host, UNSIGNED_PAYLOAD
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM_IDENTIFIER,
        amz_date,
        scope,
        hex_encode(&sha256_hash(canonical_request.as_bytes()))
    );
    let signing_key = derive_signing_key(&credentials.secret_access_key, &amz_date[..8], &options.region, &options.service)?;
    let signature = hex_encode(&hmac_sign(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "{}://{}{}?{}&{}={}",
        endpoint.scheme(), host, path, canonical_query, AMZ_SIGNATURE_QUERY_PARAM, signature
    ))
}

fn derive_scope(date: &str, region: &str, service: &str) -> String {
    let date_part = if date.len() >= 8 { &date[0..8] } else { date };
    format!("{}/{}/{}/{}", date_part, region, service, KEY_TYPE_IDENTIFIER)
}

fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> =
        params.iter().map(|(k, v)| (uri_encode(k, true), uri_encode(v, true))).collect();
    encoded.sort();
    encoded.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("&")
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> AccessResult<Vec<u8>> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sign(key.as_bytes(), date.as_bytes())?;
    let k_region = hmac_sign(&k_date, region.as_bytes())?;
    let k_service = hmac_sign(&k_region, service.as_bytes())?;
    hmac_sign(&k_service, KEY_TYPE_IDENTIFIER.as_bytes())
}

fn sha256_hash(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn hmac_sign(key: &[u8], data: &[u8]) -> AccessResult<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| AccessError::InvalidConfig(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_encode(bytes: &[u8]) -> String { bytes.iter().map(|b| format!("{:02x}", b)).collect() }

/// RFC 3986 encoding as SigV4 wants it: unreserved characters pass, everything else is
/// `%XX` uppercase. Slashes survive only in object keys.
pub fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
