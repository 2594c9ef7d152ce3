//! HTTP Digest authentication over MD5.
//!
//! Disabled entirely when no password is configured. Otherwise the first
//! unauthorized request on a connection gets a freshly minted nonce and a
//! 401; a correct `Authorization: Digest` response on a later request
//! marks the connection authorized for the rest of its lifetime.

use md5::{Digest, Md5};
use rand::RngCore;

use crate::crypto::base64_encode;
use crate::message::RtspMessage;

/// Realm advertised in the `WWW-Authenticate` challenge.
pub const REALM: &str = "raop";

/// Generate a fresh server nonce: 8 random bytes, base64-encoded.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64_encode(&bytes)
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parsed fields of an `Authorization: Digest ...` header.
#[derive(Debug)]
struct DigestParams {
    username: String,
    realm: String,
    nonce: String,
    uri: String,
    response: String,
}

fn parse_digest_header(header: &str) -> Option<DigestParams> {
    let rest = header.trim().strip_prefix("Digest")?.trim();

    let mut username = None;
    let mut realm = None;
    let mut nonce = None;
    let mut uri = None;
    let mut response = None;

    for field in split_digest_fields(rest) {
        let (key, value) = field.split_once('=')?;
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        match key {
            "username" => username = Some(value.to_string()),
            "realm" => realm = Some(value.to_string()),
            "nonce" => nonce = Some(value.to_string()),
            "uri" => uri = Some(value.to_string()),
            "response" => response = Some(value.to_string()),
            _ => {}
        }
    }

    Some(DigestParams {
        username: username?,
        realm: realm?,
        nonce: nonce?,
        uri: uri?,
        response: response?,
    })
}

/// Split `key="value", key2=value2` on commas that are not inside quotes.
fn split_digest_fields(input: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = input[start..].trim();
    if !last.is_empty() {
        fields.push(last);
    }
    fields
}

/// Compute the expected Digest response for (username, realm, password,
/// method, uri, nonce). Deterministic: identical inputs always produce
/// identical output.
pub fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Outcome of checking a request's authorization.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No password configured; every request is authorized.
    NotRequired,
    /// The connection is already authorized (sticky for its lifetime).
    AlreadyAuthorized,
    /// Digest response matched; caller should mark the connection
    /// authorized.
    Granted,
    /// No `Authorization` header, or malformed — reply 401 with a
    /// challenge for `nonce`.
    Challenge,
    /// `Authorization` header present but the response did not match —
    /// reply 401.
    Denied,
}

/// Evaluate a request against the configured password, given whether the
/// connection is already authorized and the nonce to use for a 401
/// (minted lazily by the caller on first use).
pub fn check(
    password: Option<&str>,
    already_authorized: bool,
    nonce: &str,
    request: &RtspMessage,
) -> AuthOutcome {
    let Some(password) = password else {
        return AuthOutcome::NotRequired;
    };
    if already_authorized {
        return AuthOutcome::AlreadyAuthorized;
    }

    let Some(header) = request.header("Authorization") else {
        return AuthOutcome::Challenge;
    };
    let Some(params) = parse_digest_header(header) else {
        return AuthOutcome::Challenge;
    };
    if params.nonce != nonce {
        return AuthOutcome::Challenge;
    }

    let method = request.method().unwrap_or("");
    let expected = compute_response(
        &params.username,
        &params.realm,
        password,
        method,
        &params.uri,
        nonce,
    );

    if expected == params.response {
        AuthOutcome::Granted
    } else {
        AuthOutcome::Denied
    }
}

/// Build the `WWW-Authenticate` challenge header value for a 401.
pub fn challenge_header(nonce: &str) -> String {
    format!(r#"Digest realm="{REALM}", nonce="{nonce}""#)
}
