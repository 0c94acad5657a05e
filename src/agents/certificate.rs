//! OpenSSH user certificates for posix endpoints.
//!
//! Each issuance signs a fresh ephemeral ed25519 key with the endpoint's CA key. The key id
//! carries `resource=...;method=...;ttl=...`, the resource is the only valid principal and
//! the validity window is `[now, now + ttl]`. Encoding follows the openssh
//! `ssh-ed25519-cert-v01@openssh.com` wire format, so `ssh-keygen -L -f` can inspect it.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::error::{AccessError, AccessResult};
use crate::policy::Action;

pub const CERT_TYPE: &str = "ssh-ed25519-cert-v01@openssh.com";
pub const KEY_TYPE: &str = "ssh-ed25519";
pub const USER_CERT: u32 = 1;
const COMMENT: &str = "dam";

/// Decoded, signature-checked contents of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateClaims {
    pub key_id: String,
    pub principals: Vec<String>,
    pub serial: u64,
    pub cert_type: u32,
    pub valid_after: u64,
    pub valid_before: u64,
    pub public_key: [u8; 32],
}

impl CertificateClaims {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        let t = at.timestamp().max(0) as u64;
        self.valid_after <= t && t < self.valid_before
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.valid_before as i64, 0).single()
    }
}

/// Read a PKCS#8 PEM ed25519 private key.
pub fn load_ca_key(path: &Path) -> AccessResult<SigningKey> {
    let pem = std::fs::read_to_string(path)?;
    SigningKey::from_pkcs8_pem(&pem)
        .map_err(|e| AccessError::InvalidConfig(format!("ssh ca key {}: {}", path.display(), e)))
}

pub fn key_id(resource: &str, action: Action, ttl: Duration) -> String {
    format!("resource={};method={};ttl={}", resource, action, ttl.as_secs())
}

/// `ssh-ed25519 <base64>` line for a `TrustedUserCAKeys` file.
pub fn public_key_line(key: &VerifyingKey) -> String {
    format!("{} {}", KEY_TYPE, STANDARD.encode(public_key_blob(key.as_bytes())))
}

fn random<const N: usize>() -> AccessResult<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(AccessError::backend)?;
    Ok(buf)
}

/// Sign a certificate for `resource` and return it as an openssh public key line.
pub fn issue(ca: &SigningKey, resource: &str, action: Action, ttl: Duration, now: DateTime<Utc>) -> AccessResult<String> {
    let mut seed = random::<32>()?;
    let ephemeral = SigningKey::from_bytes(&seed).verifying_key();
    seed.fill(0);
    let nonce = random::<32>()?;
    let serial = u64::from_be_bytes(random::<8>()?);
    let valid_after = now.timestamp().max(0) as u64;
    let valid_before = valid_after.saturating_add(ttl.as_secs());

    let mut principals = Vec::new();
    put_string(&mut principals, resource.as_bytes());

    let mut body = Vec::with_capacity(512);
    put_string(&mut body, CERT_TYPE.as_bytes());
    put_string(&mut body, &nonce);
    put_string(&mut body, ephemeral.as_bytes());
    body.extend_from_slice(&serial.to_be_bytes());
    body.extend_from_slice(&USER_CERT.to_be_bytes());
    put_string(&mut body, key_id(resource, action, ttl).as_bytes());
    put_string(&mut body, &principals);
    body.extend_from_slice(&valid_after.to_be_bytes());
    body.extend_from_slice(&valid_before.to_be_bytes());
    put_string(&mut body, &[]); // critical options
    put_string(&mut body, &[]); // extensions
    put_string(&mut body, &[]); // reserved
    put_string(&mut body, &public_key_blob(ca.verifying_key().as_bytes()));

    let signature = ca.sign(&body);
    let mut sig_blob = Vec::with_capacity(83);
    put_string(&mut sig_blob, KEY_TYPE.as_bytes());
    put_string(&mut sig_blob, &signature.to_bytes());
    put_string(&mut body, &sig_blob);

    Ok(format!("{} {} {}", CERT_TYPE, STANDARD.encode(&body), COMMENT))
}

/// Parse `line`, check it was signed by `ca` and return its claims. Does not check the
/// validity window; see `CertificateClaims::is_valid_at`.
pub fn verify(line: &str, ca: &VerifyingKey) -> AccessResult<CertificateClaims> {
    let mut parts = line.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    if kind != CERT_TYPE {
        return Err(malformed(format!("unexpected certificate type '{}'", kind)));
    }
    let blob = STANDARD
        .decode(parts.next().unwrap_or_default())
        .map_err(|e| malformed(e.to_string()))?;

    let mut r = Reader { buf: &blob, pos: 0 };
    if r.string()? != CERT_TYPE.as_bytes() {
        return Err(malformed("embedded type mismatch"));
    }
    let _nonce = r.string()?;
    let public_key: [u8; 32] = r.string()?.try_into().map_err(|_| malformed("public key length"))?;
    let serial = r.u64()?;
    let cert_type = r.u32()?;
    let key_id = String::from_utf8(r.string()?.to_vec()).map_err(|e| malformed(e.to_string()))?;
    let mut principals = Vec::new();
    let mut pr = Reader { buf: r.string()?, pos: 0 };
    while !pr.done() {
        principals.push(String::from_utf8(pr.string()?.to_vec()).map_err(|e| malformed(e.to_string()))?);
    }
    let valid_after = r.u64()?;
    let valid_before = r.u64()?;
    let _critical = r.string()?;
    let _extensions = r.string()?;
    let _reserved = r.string()?;
    let signer = r.string()?;
    let signed_len = r.pos;
    let sig_blob = r.string()?;
    if !r.done() {
        return Err(malformed("trailing bytes"));
    }

    if signer != public_key_blob(ca.as_bytes()).as_slice() {
        return Err(malformed("signed by a different ca"));
    }
    let mut sr = Reader { buf: sig_blob, pos: 0 };
    if sr.string()? != KEY_TYPE.as_bytes() {
        return Err(malformed("signature algorithm"));
    }
    let sig_bytes: [u8; 64] = sr.string()?.try_into().map_err(|_| malformed("signature length"))?;
    ca.verify_strict(&blob[..signed_len], &Signature::from_bytes(&sig_bytes))
        .map_err(|_| malformed("bad signature"))?;

    Ok(CertificateClaims { key_id, principals, serial, cert_type, valid_after, valid_before, public_key })
}

fn malformed(reason: impl Into<String>) -> AccessError {
    AccessError::InvalidConfig(format!("ssh certificate: {}", reason.into()))
}

fn public_key_blob(key: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(51);
    put_string(&mut out, KEY_TYPE.as_bytes());
    put_string(&mut out, key);
    out
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> AccessResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or_else(|| malformed("truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> AccessResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> AccessResult<u64> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(a))
    }

    fn string(&mut self) -> AccessResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn done(&self) -> bool { self.pos == self.buf.len() }
}
