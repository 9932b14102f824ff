//! HMAC request signing.
//!
//! Every call to the remote API carries three headers derived from one
//! canonical string:
//!
//! ```text
//! method \n nonce \n date \n content-type \n path \n query \n   (lower-cased)
//! ```
//!
//! - `Authorization: On <access_key>:HmacSHA256:<base64 hmac-sha256>`
//! - `Date`: the RFC-1123 timestamp that went into the canonical string
//! - `On-Nonce`: the nonce that went into the canonical string
//!
//! A request must be signed right before it is sent, after its query string
//! is final. Retries sign again.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use reqwest::Url;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of the per-request nonce.
pub const NONCE_LEN: usize = 25;

/// Header values for one signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub authorization: String,
    pub date: String,
    pub nonce: String,
}

/// Sign a request with a fresh nonce and the current time.
///
/// # Errors
///
/// Returns `Error::Signing` if the secret cannot key the MAC.
pub fn sign(
    method: &str,
    url: &Url,
    content_type: &str,
    access_key: &str,
    secret_key: &str,
) -> Result<SignedRequest> {
    let nonce = generate_nonce();
    let date = http_date(chrono::Utc::now());
    let authorization = signature(
        method,
        url,
        &nonce,
        &date,
        content_type,
        access_key,
        secret_key,
    )?;

    Ok(SignedRequest {
        authorization,
        date,
        nonce,
    })
}

/// Compute the `Authorization` value for explicit nonce and date.
///
/// Deterministic for identical inputs.
///
/// # Errors
///
/// Returns `Error::Signing` if the secret cannot key the MAC.
pub fn signature(
    method: &str,
    url: &Url,
    nonce: &str,
    date: &str,
    content_type: &str,
    access_key: &str,
    secret_key: &str,
) -> Result<String> {
    let canonical = canonical_string(method, url, nonce, date, content_type);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|e| Error::Signing(e.to_string()))?;
    mac.update(canonical.as_bytes());
    let digest = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!("On {access_key}:HmacSHA256:{digest}"))
}

/// Build the lower-cased string the MAC is computed over.
#[must_use]
pub fn canonical_string(
    method: &str,
    url: &Url,
    nonce: &str,
    date: &str,
    content_type: &str,
) -> String {
    let path = url.path();
    let query = url.query().unwrap_or("");
    format!("{method}\n{nonce}\n{date}\n{content_type}\n{path}\n{query}\n").to_lowercase()
}

/// 25 alphanumeric characters from the OS CSPRNG.
#[must_use]
pub fn generate_nonce() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// RFC-1123 date in GMT, as the `Date` header expects.
#[must_use]
pub fn http_date(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_canonical_string_layout() {
        let u = url("https://cad.onshape.com/api/v6/documents?q=Bracket&limit=20");
        let s = canonical_string("GET", &u, "AbC123", "Tue, 19 Oct 2026 10:00:00 GMT", "");

        assert_eq!(
            s,
            "get\nabc123\ntue, 19 oct 2026 10:00:00 gmt\n\n/api/v6/documents\nq=bracket&limit=20\n"
        );
    }

    #[test]
    fn test_canonical_string_empty_query() {
        let u = url("https://cad.onshape.com/api/v6/users/current");
        let s = canonical_string("GET", &u, "n", "d", "application/json");
        assert!(s.ends_with("/api/v6/users/current\n\n"));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let u = url("https://cad.onshape.com/api/v6/documents");
        let a = signature("GET", &u, "nonce", "date", "", "AK", "SK").unwrap();
        let b = signature("GET", &u, "nonce", "date", "", "AK", "SK").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("On AK:HmacSHA256:"));
    }

    #[test]
    fn test_different_nonces_different_signatures() {
        let u = url("https://cad.onshape.com/api/v6/documents");
        let a = signature("GET", &u, "nonce-one", "date", "", "AK", "SK").unwrap();
        let b = signature("GET", &u, "nonce-two", "date", "", "AK", "SK").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_query_is_part_of_signature() {
        let a = signature(
            "GET",
            &url("https://h/api/v6/documents?offset=0"),
            "n",
            "d",
            "",
            "AK",
            "SK",
        )
        .unwrap();
        let b = signature(
            "GET",
            &url("https://h/api/v6/documents?offset=20"),
            "n",
            "d",
            "",
            "AK",
            "SK",
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_known_digest() {
        // HMAC-SHA256("SK", "get\nn\nd\n\n/p\n\n") computed independently.
        let u = url("https://h/p");
        let canonical = canonical_string("GET", &u, "n", "d", "");
        let mut mac = HmacSha256::new_from_slice(b"SK").unwrap();
        mac.update(canonical.as_bytes());
        let expected = format!(
            "On AK:HmacSHA256:{}",
            BASE64.encode(mac.finalize().into_bytes())
        );

        assert_eq!(signature("GET", &u, "n", "d", "", "AK", "SK").unwrap(), expected);
    }

    #[test]
    fn test_sign_headers_match_signature_inputs() {
        let u = url("https://cad.onshape.com/api/v6/documents?limit=100");
        let signed = sign("GET", &u, "", "AK", "SK").unwrap();

        let recomputed =
            signature("GET", &u, &signed.nonce, &signed.date, "", "AK", "SK").unwrap();
        assert_eq!(signed.authorization, recomputed);
    }

    #[test]
    fn test_nonce_shape() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_http_date_format() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        assert_eq!(http_date(at), "Mon, 19 Oct 2026 10:00:00 GMT");
    }
}
