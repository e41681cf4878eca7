//! Issuer-scoped, RSA-signed, operation-bound authorisation tokens (C1).
//!
//! Built on `jsonwebtoken` (RS256). Registered claims `iss`/`iat`/`nbf`/
//! `exp` carry the application claims in a nested `params`-bearing struct.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TokenError};

pub const CLONE_ISSUER: &str = "cdi-apiserver.clone";
pub const UPLOAD_ISSUER: &str = "cdi-apiserver.upload";

pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub resource: String,
}

/// The application claims payload embedded in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub operation: Operation,
    pub name: String,
    pub namespace: String,
    pub resource: ResourceRef,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Registered + application claims as serialised into the JWT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    iss: String,
    iat: i64,
    nbf: i64,
    exp: i64,
    #[serde(flatten)]
    claims: Claims,
}

/// Signs tokens for a single fixed issuer.
pub struct TokenIssuer {
    issuer: String,
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(issuer: impl Into<String>, private_key_pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|_| TokenError::Malformed.opaque())?;
        Ok(Self {
            issuer: issuer.into(),
            key,
        })
    }

    /// Issue a signed token with `iat = nbf = now`, `exp = now + ttl`.
    pub fn issue(&self, claims: Claims, ttl: Duration) -> Result<String> {
        let now = Utc::now().timestamp();
        let envelope = Envelope {
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp: now + ttl.as_secs() as i64,
            claims,
        };
        let header = Header::new(Algorithm::RS256);
        jsonwebtoken::encode(&header, &envelope, &self.key)
            .map_err(|_| TokenError::Malformed.opaque())
    }
}

/// Validates tokens for a single fixed issuer, public key, and clock
/// leeway.
pub struct TokenValidator {
    issuer: String,
    key: DecodingKey,
    leeway: Duration,
}

impl TokenValidator {
    pub fn new(issuer: impl Into<String>, public_key_pem: &[u8], leeway: Duration) -> Result<Self> {
        let key =
            DecodingKey::from_rsa_pem(public_key_pem).map_err(|_| TokenError::Malformed.opaque())?;
        Ok(Self {
            issuer: issuer.into(),
            key,
            leeway,
        })
    }

    /// Validate the token's signature, issuer, and `[nbf-leeway, exp+leeway]`
    /// window, returning the claims payload on success. Every failure
    /// kind collapses into the same opaque [`Error::InvalidToken`] — see
    /// [`TokenError::opaque`].
    pub fn validate(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.leeway = self.leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // jsonwebtoken applies `leeway` symmetrically to both nbf and exp.

        let data = jsonwebtoken::decode::<Envelope>(token, &self.key, &validation)
            .map_err(|e| classify(e.into_kind()).opaque())?;
        Ok(data.claims.claims)
    }
}

fn classify(kind: jsonwebtoken::errors::ErrorKind) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match kind {
        ErrorKind::InvalidSignature => TokenError::BadSignature,
        ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        _ => TokenError::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A throwaway 2048-bit RSA test keypair (PKCS#1/PKCS#8 PEM), generated
    // once for this crate's tests only.
    const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/test_rsa_private.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../tests/fixtures/test_rsa_public.pem");

    fn claims() -> Claims {
        Claims {
            operation: Operation::Clone,
            name: "pvc-src".into(),
            namespace: "stage".into(),
            resource: ResourceRef {
                group: String::new(),
                version: "v1".into(),
                resource: "persistentvolumeclaims".into(),
            },
            params: HashMap::from([
                ("targetNamespace".to_string(), "prod".to_string()),
                ("targetName".to_string(), "pvc-dst".to_string()),
            ]),
        }
    }

    #[test]
    fn round_trip_within_ttl_and_leeway_succeeds() {
        let issuer = TokenIssuer::new(CLONE_ISSUER, TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let validator =
            TokenValidator::new(CLONE_ISSUER, TEST_PUBLIC_KEY.as_bytes(), DEFAULT_LEEWAY).unwrap();

        let token = issuer.issue(claims(), Duration::from_secs(60)).unwrap();
        let validated = validator.validate(&token).unwrap();
        assert_eq!(validated, claims());
    }

    #[test]
    fn expired_token_rejected_outside_leeway() {
        let issuer = TokenIssuer::new(CLONE_ISSUER, TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let validator = TokenValidator::new(
            CLONE_ISSUER,
            TEST_PUBLIC_KEY.as_bytes(),
            Duration::from_secs(0),
        )
        .unwrap();

        // ttl=0 means exp == iat == now; sleeping past it should fail.
        let token = issuer.issue(claims(), Duration::from_secs(0)).unwrap();
        std::thread::sleep(Duration::from_secs(2));
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn wrong_issuer_rejected() {
        let issuer = TokenIssuer::new(CLONE_ISSUER, TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let validator =
            TokenValidator::new(UPLOAD_ISSUER, TEST_PUBLIC_KEY.as_bytes(), DEFAULT_LEEWAY).unwrap();

        let token = issuer.issue(claims(), Duration::from_secs(60)).unwrap();
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn tampered_signature_rejected() {
        let issuer = TokenIssuer::new(CLONE_ISSUER, TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let validator =
            TokenValidator::new(CLONE_ISSUER, TEST_PUBLIC_KEY.as_bytes(), DEFAULT_LEEWAY).unwrap();

        let mut token = issuer.issue(claims(), Duration::from_secs(60)).unwrap();
        token.push('x');
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn classify_maps_jsonwebtoken_error_kinds() {
        use jsonwebtoken::errors::ErrorKind;
        assert_eq!(classify(ErrorKind::ExpiredSignature), TokenError::Expired);
        assert_eq!(classify(ErrorKind::InvalidIssuer), TokenError::WrongIssuer);
        assert_eq!(
            classify(ErrorKind::InvalidSignature),
            TokenError::BadSignature
        );
        assert_eq!(
            classify(ErrorKind::ImmatureSignature),
            TokenError::NotYetValid
        );
        assert_eq!(classify(ErrorKind::InvalidToken), TokenError::Malformed);
    }
}
