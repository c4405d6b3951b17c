//! Webhook registration records and signature configuration.

/// A registered webhook endpoint.
#[derive(Clone, Debug)]
pub struct WebhookRegistration {
    pub id: String,
    pub api_name: String,
    pub path: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: f64,
}

/// HMAC digest algorithm used to verify a webhook's signature header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1,
    Sha256,
}

impl SignatureAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Some(SignatureAlgorithm::Sha1),
            "sha256" => Some(SignatureAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1 => "sha1",
            SignatureAlgorithm::Sha256 => "sha256",
        }
    }
}

/// HMAC verification configuration for a single webhook.
#[derive(Clone, Debug)]
pub struct SignatureConfig {
    pub secret: String,
    pub header_name: String,
    pub algorithm: SignatureAlgorithm,
}

impl SignatureConfig {
    pub fn new(secret: impl Into<String>, header_name: impl Into<String>, algorithm: SignatureAlgorithm) -> Self {
        SignatureConfig {
            secret: secret.into(),
            header_name: header_name.into(),
            algorithm,
        }
    }
}
