use anyhow::{bail, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::SessionCredential;

/// Session credential issuer identifier
const ISSUER: &str = "portal-auth/session";

const AUDIENCE_ADMIN: &str = "admin";
const AUDIENCE_CLIENT: &str = "client";

/// Registered claims (RFC 7519). The audience carries the admin snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    pub aud: String, // "admin" or "client", the claim snapshot at mint time
    pub exp: usize,  // Expiration time (timestamp)
    pub iat: usize,  // Time at which the credential was minted (timestamp)
    pub iss: String, // Issuer
    pub nbf: usize,  // Time before which the credential must not be accepted
    pub sub: String, // Principal id
    pub email: String,
}

/// Signs session credentials with the server's RSA private key.
pub struct SessionTokenSigner {
    key: EncodingKey,
    /// Policy window in seconds
    expiry: usize,
}

impl SessionTokenSigner {
    /// # Arguments
    /// * `private_key` - RSA private key in PEM format
    /// * `expiry` - Credential lifetime in seconds
    pub fn new(private_key: &[u8], expiry: u64) -> Result<Self> {
        let key = match EncodingKey::from_rsa_pem(private_key) {
            Ok(key) => key,
            Err(e) => bail!("parse RSA private key for session signing failed: {e}"),
        };
        Ok(Self {
            key,
            expiry: expiry as usize,
        })
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        let private_key = include_bytes!("../testdata/session_private.pem");
        Self::new(private_key, 3600).unwrap()
    }

    pub fn sign(&self, uid: &str, email: &str, admin: bool, now: u64) -> Result<(String, SessionCredential)> {
        let now = now as usize;

        let aud = if admin { AUDIENCE_ADMIN } else { AUDIENCE_CLIENT };

        let claims = Claims {
            aud: String::from(aud),
            exp: now + self.expiry,
            iat: now,
            iss: String::from(ISSUER),
            nbf: now,
            sub: uid.to_string(),
            email: email.to_string(),
        };

        let token = match encode(&Header::new(Algorithm::RS256), &claims, &self.key) {
            Ok(token) => token,
            Err(e) => bail!("sign session credential failed: {e}"),
        };

        Ok((
            token,
            SessionCredential {
                uid: claims.sub,
                email: claims.email,
                admin,
                issued_at: claims.iat as u64,
                expires_at: claims.exp as u64,
            },
        ))
    }
}

/// Verifies session credentials with the matching public key. Pure local
/// cryptography, no I/O.
pub struct SessionTokenVerifier {
    key: DecodingKey,
}

impl SessionTokenVerifier {
    /// # Arguments
    /// * `public_key` - RSA public key in PEM format
    pub fn new(public_key: &[u8]) -> Result<Self> {
        let key = match DecodingKey::from_rsa_pem(public_key) {
            Ok(key) => key,
            Err(e) => bail!("parse RSA public key for session verification failed: {e}"),
        };
        Ok(Self { key })
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        let public_key = include_bytes!("../testdata/session_public.pem");
        Self::new(public_key).unwrap()
    }

    pub fn verify(&self, token: &str, now: u64) -> Result<SessionCredential> {
        if token.is_empty() {
            bail!("empty session credential");
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["aud", "exp", "iat", "iss", "nbf", "sub"]);
        validation.set_audience(&[AUDIENCE_ADMIN, AUDIENCE_CLIENT]);
        // Lifetime is checked below against the caller's clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let claims = match decode::<Claims>(token, &self.key, &validation) {
            Ok(data) => data.claims,
            Err(e) => bail!("verify session credential failed: {e}"),
        };

        if claims.sub.is_empty() {
            bail!("verify session credential failed: empty subject");
        }

        let now = now as usize;
        if now >= claims.exp {
            bail!("verify session credential failed: expired");
        }

        if now < claims.nbf {
            bail!("verify session credential failed: not yet valid");
        }

        Ok(SessionCredential {
            uid: claims.sub,
            email: claims.email,
            admin: claims.aud == AUDIENCE_ADMIN,
            issued_at: claims.iat as u64,
            expires_at: claims.exp as u64,
        })
    }
}
