//! HMAC signature verification and provider verification-handshake detection.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::webhook::registration::{SignatureAlgorithm, SignatureConfig};
use crate::webhook::server::WebhookRequest;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Verifies `signature_header` against an HMAC of `body` computed with
/// `config`. Accepts either hex digests prefixed `"sha1="`/`"sha256="` (the
/// GitHub/Stripe convention, detected by the literal substring `"sha"` in the
/// received value) or raw base64 digests, matching the two formats the
/// provider landscape actually uses. Comparison is constant-time.
pub fn verify_signature(config: &SignatureConfig, body: &[u8], signature_header: &str) -> bool {
    let digest = match config.algorithm {
        SignatureAlgorithm::Sha1 => compute_hmac_sha1(config.secret.as_bytes(), body),
        SignatureAlgorithm::Sha256 => compute_hmac_sha256(config.secret.as_bytes(), body),
    };

    if signature_header.to_ascii_lowercase().contains("sha") {
        let expected = format!("sha{}=", &config.algorithm.as_str()[3..]) + &hex::encode(&digest);
        expected.as_bytes().ct_eq(signature_header.as_bytes()).into()
    } else {
        let expected = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &digest);
        expected.as_bytes().ct_eq(signature_header.as_bytes()).into()
    }
}

fn compute_hmac_sha1(secret: &[u8], body: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

fn compute_hmac_sha256(secret: &[u8], body: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// `true` if `req` is a provider verification handshake rather than a
/// regular event delivery, per the four recognized conventions: GitHub's
/// `ping` event, Facebook's `hub.mode`/`hub.verify_token` challenge, Stripe's
/// signature-header-with-empty-body heuristic, and a generic `verify` query
/// parameter.
///
/// The Stripe check is a heuristic, not a protocol guarantee: Stripe does not
/// send a distinct verification request type, so an empty-bodied POST
/// carrying `Stripe-Signature` is treated as one. A genuine Stripe event with
/// an empty body would also match; Stripe never sends one in practice.
pub fn is_verification_request(req: &WebhookRequest) -> bool {
    if req.header("x-github-event").map(|v| v == "ping").unwrap_or(false) {
        return true;
    }
    if req.method == "GET" && req.query_param("hub.mode").is_some() && req.query_param("hub.verify_token").is_some() {
        return true;
    }
    if req.method == "POST" && req.header("stripe-signature").is_some() && req.body.is_empty() {
        return true;
    }
    if req.method == "GET" && req.query_param("verify").is_some() {
        return true;
    }
    false
}

/// Builds the plaintext response for a recognized verification handshake.
/// `verification_token` is the token configured for the webhook's API, if
/// any.
pub fn handle_verification_request(req: &WebhookRequest, verification_token: Option<&str>) -> String {
    if req.header("x-github-event").map(|v| v == "ping").unwrap_or(false) {
        return "{\"message\": \"Webhook verification successful\"}".to_string();
    }

    if req.method == "GET" {
        if let (Some(mode), Some(token)) = (req.query_param("hub.mode"), req.query_param("hub.verify_token")) {
            let challenge = req.query_param("hub.challenge").unwrap_or_default().to_string();
            return if mode == "subscribe" && Some(token) == verification_token {
                challenge
            } else {
                "Webhook verification failed: invalid verification token".to_string()
            };
        }

        if let Some(token) = req.query_param("verify") {
            return if Some(token) == verification_token {
                "Webhook verification successful".to_string()
            } else {
                "Webhook verification failed: invalid verification token".to_string()
            };
        }
    }

    "Webhook verification failed: unknown verification method".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(method: &str, headers: &[(&str, &str)], query: &[(&str, &str)], body: &[u8]) -> WebhookRequest {
        WebhookRequest {
            id: "evt".to_string(),
            timestamp: 0.0,
            method: method.to_string(),
            path: "/hook".to_string(),
            query_params: query.iter().map(|(k, v)| (k.to_string(), vec![v.to_string()])).collect(),
            headers: headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.to_string())).collect(),
            remote_addr: "127.0.0.1".to_string(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn hex_signature_matches_expected_digest() {
        let config = SignatureConfig::new("secret", "X-Hub-Signature-256", SignatureAlgorithm::Sha256);
        let digest = compute_hmac_sha256(b"secret", b"payload");
        let header = format!("sha256={}", hex::encode(digest));
        assert!(verify_signature(&config, b"payload", &header));
        assert!(!verify_signature(&config, b"payload", "sha256=deadbeef"));
    }

    #[test]
    fn base64_signature_matches_expected_digest() {
        let config = SignatureConfig::new("secret", "X-Signature", SignatureAlgorithm::Sha1);
        let digest = compute_hmac_sha1(b"secret", b"payload");
        let header = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &digest);
        assert!(verify_signature(&config, b"payload", &header));
    }

    #[test]
    fn github_ping_is_verification_request() {
        let req = request("POST", &[("X-GitHub-Event", "ping")], &[], b"{}");
        assert!(is_verification_request(&req));
    }

    #[test]
    fn facebook_handshake_returns_challenge_on_valid_token() {
        let req = request(
            "GET",
            &[],
            &[("hub.mode", "subscribe"), ("hub.verify_token", "tok"), ("hub.challenge", "123")],
            b"",
        );
        assert!(is_verification_request(&req));
        assert_eq!(handle_verification_request(&req, Some("tok")), "123");
        assert!(handle_verification_request(&req, Some("other")).contains("failed"));
    }

    #[test]
    fn stripe_heuristic_requires_empty_body() {
        let with_body = request("POST", &[("Stripe-Signature", "t=1,v1=abc")], &[], b"{}");
        let without_body = request("POST", &[("Stripe-Signature", "t=1,v1=abc")], &[], b"");
        assert!(!is_verification_request(&with_body));
        assert!(is_verification_request(&without_body));
    }

    #[test]
    fn generic_verify_param_detected() {
        let req = request("GET", &[], &[("verify", "tok")], b"");
        assert!(is_verification_request(&req));
        assert_eq!(handle_verification_request(&req, Some("tok")), "Webhook verification successful");
    }
}
