//! Advisory decoding of bearer token payloads.
//!
//! Nothing here verifies a signature. The decoded expiry is a hint used to
//! decide when to refresh; the backend stays the only authority on whether a
//! token is valid, and no authorization decision may rest on these claims.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value as JsonValue};

/// URL-safe base64 that accepts payload segments with or without padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Unverified claims read from a token's payload segment.
///
/// Timestamps may carry a fractional part. A claim of the wrong type reads
/// as absent rather than failing the whole decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    /// Expiry as seconds since the Unix epoch
    pub exp: Option<f64>,
    pub iat: Option<f64>,
    pub sub: Option<JsonValue>,
    pub extra: Map<String, JsonValue>,
}

impl Claims {
    fn from_map(mut map: Map<String, JsonValue>) -> Self {
        let exp = map.remove("exp").and_then(|v| numeric_date(&v));
        let iat = map.remove("iat").and_then(|v| numeric_date(&v));
        let sub = map.remove("sub").filter(|v| !v.is_null());
        Self {
            exp,
            iat,
            sub,
            extra: map,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(to_datetime)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(to_datetime)
    }
}

/// A NumericDate claim: a finite JSON number of seconds.
fn numeric_date(value: &JsonValue) -> Option<f64> {
    value.as_f64().filter(|secs| secs.is_finite())
}

/// Whole seconds, rounded down.
fn to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    let floored = secs.floor();
    if floored < i64::MIN as f64 || floored > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp(floored as i64, 0)
}

/// Decode the payload segment of a `header.payload.signature` token.
///
/// Returns `None` on any structural failure: wrong segment count, bad
/// base64, or a payload that is not a JSON object.
pub fn decode(token: &str) -> Option<Claims> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }

    let bytes = PAYLOAD_ENGINE.decode(payload).ok()?;
    match serde_json::from_slice::<JsonValue>(&bytes).ok()? {
        JsonValue::Object(map) => Some(Claims::from_map(map)),
        _ => None,
    }
}

/// Embedded expiry of a token, if it decodes and carries one.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    decode(token).and_then(|claims| claims.expires_at())
}

/// True if the token is malformed, has no expiry, or the expiry has passed.
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, Utc::now())
}

pub fn is_expired_at(token: &str, now: DateTime<Utc>) -> bool {
    match expires_at(token) {
        Some(expiry) => now >= expiry,
        None => true,
    }
}

/// True unless the token carries an expiry more than `window` in the future.
pub fn expires_within(token: &str, window: Duration) -> bool {
    match expires_at(token) {
        Some(expiry) => expiry - Utc::now() <= window,
        None => true,
    }
}

/// True only for a token that decodes and whose expiry has passed.
///
/// Refresh tokens are often opaque; an undecodable one is not "detectably"
/// expired and is left for the backend to judge.
pub fn is_detectably_expired(token: &str) -> bool {
    matches!(expires_at(token), Some(expiry) if Utc::now() >= expiry)
}

/// Build an unsigned token with the given payload. Test helper.
#[cfg(test)]
pub(crate) fn encode_unsigned(payload: &JsonValue) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}

/// Unsigned token expiring `seconds` from now (negative for the past). Test helper.
#[cfg(test)]
pub(crate) fn token_expiring_in(seconds: i64) -> String {
    let exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
    encode_unsigned(&serde_json::json!({ "sub": "user-1", "exp": exp }))
}
