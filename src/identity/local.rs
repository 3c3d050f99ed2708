use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

use super::{is_admin_claim, Claims, IdToken, IdentityProvider, Principal};

/// Identity token issuer identifier
const ISSUER: &str = "portal-auth/identity";

/// Audience every identity token is minted for
const AUDIENCE: &str = "portal-auth";

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS principal (
    uid TEXT PRIMARY KEY NOT NULL,
    email TEXT NOT NULL UNIQUE,
    claims TEXT NOT NULL,
    create_time INTEGER NOT NULL
);
"#;

/// Registered claims (RFC 7519) plus the provider's own `email`/`admin`.
#[derive(Debug, Serialize, Deserialize)]
struct IdTokenClaims {
    aud: String,
    exp: usize,
    iat: usize,
    iss: String,
    nbf: usize,
    sub: String,
    email: String,
    #[serde(default)]
    admin: bool,
}

/// Bundled identity provider: principals live in their own SQLite table and
/// identity tokens are RS256 JWTs signed with the provider's key pair.
pub struct LocalIdentityProvider {
    conn: Mutex<Connection>,

    encoding_key: EncodingKey,
    decoding_key: DecodingKey,

    /// Identity token lifetime in seconds
    token_ttl: u64,
}

impl LocalIdentityProvider {
    pub fn open(path: &Path, private_key: &[u8], public_key: &[u8], token_ttl: u64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open identity database {}", path.display()))?;
        Self::new(conn, private_key, public_key, token_ttl)
    }

    pub fn memory(private_key: &[u8], public_key: &[u8], token_ttl: u64) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory identity database")?;
        Self::new(conn, private_key, public_key, token_ttl)
    }

    fn new(conn: Connection, private_key: &[u8], public_key: &[u8], token_ttl: u64) -> Result<Self> {
        conn.execute_batch(CREATE_TABLE_SQL)
            .context("create principal table")?;
        let encoding_key = match EncodingKey::from_rsa_pem(private_key) {
            Ok(key) => key,
            Err(e) => bail!("parse RSA private key for identity tokens failed: {e}"),
        };
        let decoding_key = match DecodingKey::from_rsa_pem(public_key) {
            Ok(key) => key,
            Err(e) => bail!("parse RSA public key for identity tokens failed: {e}"),
        };
        Ok(Self {
            conn: Mutex::new(conn),
            encoding_key,
            decoding_key,
            token_ttl,
        })
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        let private_key = include_bytes!("../testdata/identity_private.pem");
        let public_key = include_bytes!("../testdata/identity_public.pem");
        Self::memory(private_key, public_key, 3600).unwrap()
    }

    /// Authenticates `email`, registering it on first use, and returns a
    /// fresh identity token.
    pub fn sign_in(&self, email: &str, now: u64) -> AuthResult<String> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidArgument(String::from(
                "a valid email is required",
            )));
        }

        let uid = match self.find_by_email(email)? {
            Some(principal) => principal.uid,
            None => {
                let uid = Uuid::new_v4().simple().to_string();
                self.with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO principal (uid, email, claims, create_time) VALUES (?, ?, ?, ?)",
                        params![uid, email, "{}", now as i64],
                    )?;
                    Ok(())
                })?;
                info!("Registered principal {uid} for {email}");
                uid
            }
        };

        self.issue_id_token(&uid, now)
    }

    /// Signs a new identity token reflecting the principal's current claims.
    pub fn issue_id_token(&self, uid: &str, now: u64) -> AuthResult<String> {
        let principal = self.find_by_uid(uid)?.ok_or_else(|| AuthError::NotFound(uid.to_string()))?;
        let now = now as usize;

        let claims = IdTokenClaims {
            aud: String::from(AUDIENCE),
            exp: now + self.token_ttl as usize,
            iat: now,
            iss: String::from(ISSUER),
            nbf: now,
            sub: principal.uid,
            admin: is_admin_claim(&principal.claims),
            email: principal.email,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("sign identity token failed: {e}")))
    }

    fn with_conn<T, F>(&self, f: F) -> AuthResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuthError::provider(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(AuthError::provider)
    }

    fn find_by_uid(&self, uid: &str) -> AuthResult<Option<Principal>> {
        debug!("Identity get_user: {uid}");
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT uid, email, claims FROM principal WHERE uid = ?",
                params![uid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;
        row.map(parse_principal).transpose()
    }

    fn find_by_email(&self, email: &str) -> AuthResult<Option<Principal>> {
        debug!("Identity get_user_by_email: {email}");
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT uid, email, claims FROM principal WHERE email = ?",
                params![email],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;
        row.map(parse_principal).transpose()
    }
}

fn parse_principal((uid, email, claims): (String, String, String)) -> AuthResult<Principal> {
    let claims: Claims = serde_json::from_str(&claims)
        .map_err(|e| AuthError::Internal(format!("corrupted claims for {uid}: {e}")))?;
    Ok(Principal { uid, email, claims })
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn verify_id_token(&self, token: &str, now: u64) -> AuthResult<IdToken> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken(String::from("missing identity token")));
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.set_required_spec_claims(&["aud", "exp", "iat", "iss", "nbf", "sub"]);
        // Lifetime is checked below against the caller's clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let claims = match decode::<IdTokenClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => return Err(AuthError::InvalidToken(format!("verify identity token: {e}"))),
        };

        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken(String::from("empty subject")));
        }

        let now = now as usize;
        if now >= claims.exp {
            return Err(AuthError::InvalidToken(String::from("identity token expired")));
        }
        if now < claims.nbf {
            return Err(AuthError::InvalidToken(String::from(
                "identity token not yet valid",
            )));
        }

        Ok(IdToken {
            uid: claims.sub,
            email: claims.email,
            admin: claims.admin,
            issued_at: claims.iat as u64,
            expires_at: claims.exp as u64,
        })
    }

    async fn get_user(&self, uid: &str) -> AuthResult<Principal> {
        self.find_by_uid(uid)?
            .ok_or_else(|| AuthError::NotFound(format!("principal {uid}")))
    }

    async fn get_user_by_email(&self, email: &str) -> AuthResult<Principal> {
        self.find_by_email(email)?
            .ok_or_else(|| AuthError::NotFound(format!("principal {email}")))
    }

    async fn set_custom_claims(&self, uid: &str, claims: Claims) -> AuthResult<()> {
        let data = serde_json::Value::Object(claims).to_string();
        debug!("Identity set_custom_claims: {uid}, {data}");
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE principal SET claims = ? WHERE uid = ?",
                params![data, uid],
            )
        })?;
        if updated == 0 {
            return Err(AuthError::NotFound(format!("principal {uid}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_sign_in_and_verify() {
        let provider = LocalIdentityProvider::new_test();
        let now = 1_700_000_000;

        let token = provider.sign_in("alice@example.com", now).unwrap();
        let id = provider.verify_id_token(&token, now).await.unwrap();
        assert_eq!(id.email, "alice@example.com");
        assert!(!id.admin);
        assert_eq!(id.expires_at, now + 3600);

        // Second sign-in maps to the same principal.
        let again = provider.sign_in("alice@example.com", now + 5).unwrap();
        let id2 = provider.verify_id_token(&again, now + 5).await.unwrap();
        assert_eq!(id.uid, id2.uid);

        assert!(matches!(
            provider.verify_id_token(&token, now + 3600).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            provider.verify_id_token(&token, now - 10).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            provider.verify_id_token("not a token", now).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            provider.verify_id_token("", now).await,
            Err(AuthError::InvalidToken(_))
        ));

        assert!(matches!(
            provider.sign_in("not-an-email", now),
            Err(AuthError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_claims() {
        let provider = LocalIdentityProvider::new_test();
        let now = 1_700_000_000;
        let token = provider.sign_in("bob@example.com", now).unwrap();
        let uid = provider.verify_id_token(&token, now).await.unwrap().uid;

        let principal = provider.get_user_by_email("bob@example.com").await.unwrap();
        assert_eq!(principal.uid, uid);
        assert!(principal.claims.is_empty());
        assert!(!principal.is_admin());

        let mut claims = Claims::new();
        claims.insert(String::from("admin"), json!(true));
        claims.insert(String::from("tier"), json!("gold"));
        provider.set_custom_claims(&uid, claims.clone()).await.unwrap();

        let principal = provider.get_user(&uid).await.unwrap();
        assert_eq!(principal.claims, claims);
        assert!(principal.is_admin());

        // Tokens issued before the claim change keep the old snapshot.
        let stale = provider.verify_id_token(&token, now).await.unwrap();
        assert!(!stale.admin);
        let fresh = provider.issue_id_token(&uid, now + 1).unwrap();
        assert!(provider.verify_id_token(&fresh, now + 1).await.unwrap().admin);

        assert!(matches!(
            provider.get_user("missing").await,
            Err(AuthError::NotFound(_))
        ));
        assert!(matches!(
            provider.get_user_by_email("nobody@example.com").await,
            Err(AuthError::NotFound(_))
        ));
        assert!(matches!(
            provider.set_custom_claims("missing", Claims::new()).await,
            Err(AuthError::NotFound(_))
        ));
    }
}
