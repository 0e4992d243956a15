//! C7 Authenticator (spec §4.6).
//!
//! No teacher module implements authentication — the CLI's `main.rs` sends a
//! `{token}` or `{username,password}` JSON message inline and accepts either
//! a flat or wrapped `AuthResponse`, which grounds the token-vs-credentials
//! shape kept in `server::rest`'s login handler. The hashing/signing stack
//! is pulled from `other_examples/manifests/morenodevai-haven/Cargo.toml`,
//! the pack's only manifest with an aligned auth stack (`argon2` +
//! `jsonwebtoken`).

use crate::error::ConnectError;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "lumo";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password_hash: String,
    pub created_at: i64,
    pub modified_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    users: HashMap<String, Credential>,
}

/// Minimum claim set required by spec §4.6: `{username, issued-at,
/// expires-at}`, plus `typ` (access/refresh discriminator) and `jti` (used
/// to make refresh tokens single-use).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub typ: String,
    pub jti: String,
}

pub struct TokenPair {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Owns the on-disk credential store and the process-local JWT secret.
/// Writes are serialized through `write_lock`; reads proceed concurrently
/// through the `RwLock` (spec §5's credential-store policy).
pub struct Authenticator {
    store: RwLock<HashMap<String, Credential>>,
    write_lock: Mutex<()>,
    path: PathBuf,
    jwt_secret: Vec<u8>,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    // Single-use refresh tokens (DESIGN.md Open Question resolution #3):
    // a consumed `jti` may never be redeemed again, even before it expires.
    consumed_refresh_jti: RwLock<HashSet<String>>,
}

impl Authenticator {
    /// Load the credential store and JWT secret from `config_dir`,
    /// generating a fresh secret on first boot (spec §6.4).
    pub fn load_or_init(
        config_dir: &Path,
        jwt_secret_override: Option<String>,
        access_ttl_hours: i64,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let path = config_dir.join("credentials.json");
        let store = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str::<CredentialFile>(&text)
                .unwrap_or_default()
                .users
        } else {
            HashMap::new()
        };

        let jwt_secret = match jwt_secret_override {
            Some(s) => s.into_bytes(),
            None => load_or_generate_secret(&config_dir.join("jwt_secret"))?,
        };

        Ok(Self {
            store: RwLock::new(store),
            write_lock: Mutex::new(()),
            path,
            jwt_secret,
            access_ttl_secs: access_ttl_hours.max(1) * 3600,
            // Refresh validity is a longer-lived capability than access
            // (spec §3 Credential record); a week of access-TTL multiples
            // keeps it comfortably longer without a second config knob.
            refresh_ttl_secs: access_ttl_hours.max(1) * 3600 * 7,
            consumed_refresh_jti: RwLock::new(HashSet::new()),
        })
    }

    pub async fn has_users(&self) -> bool {
        !self.store.read().await.is_empty()
    }

    /// True iff the default-seeded `admin`/`lumo` pair is still active.
    /// Surfaced so the operator gets a conspicuous boot warning (DESIGN.md
    /// Open Question resolution #4) without this module silently refusing
    /// to bind non-loopback interfaces.
    pub async fn has_default_credentials(&self) -> bool {
        match self.store.read().await.get(DEFAULT_USERNAME) {
            Some(cred) => verify_password(DEFAULT_PASSWORD, &cred.password_hash),
            None => false,
        }
    }

    /// Seed the single default account if the store is empty (spec §4.6).
    pub async fn seed_default_if_empty(&self) -> anyhow::Result<()> {
        if self.has_users().await {
            return Ok(());
        }
        log::warn!(
            "auth: no users configured — seeding default account '{DEFAULT_USERNAME}'/'{DEFAULT_PASSWORD}'. CHANGE THIS PASSWORD IMMEDIATELY."
        );
        self.create_user(DEFAULT_USERNAME, DEFAULT_PASSWORD).await
    }

    async fn create_user(&self, username: &str, password: &str) -> anyhow::Result<()> {
        let password_hash = hash_password(password)?;
        let now = now_unix();
        let cred = Credential {
            username: username.to_string(),
            password_hash,
            created_at: now,
            modified_at: now,
        };
        let _guard = self.write_lock.lock().await;
        self.store.write().await.insert(username.to_string(), cred);
        self.persist_locked().await
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), ConnectError> {
        let store = self.store.read().await;
        let cred = store.get(username).ok_or(ConnectError::UserNotFound)?;
        if verify_password(password, &cred.password_hash) {
            Ok(())
        } else {
            Err(ConnectError::InvalidCredentials)
        }
    }

    pub async fn update_password(
        &self,
        username: &str,
        new_password: &str,
    ) -> Result<(), ConnectError> {
        let password_hash = hash_password(new_password)
            .map_err(|e| ConnectError::BadRequest(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        {
            let mut store = self.store.write().await;
            let cred = store.get_mut(username).ok_or(ConnectError::UserNotFound)?;
            cred.password_hash = password_hash;
            cred.modified_at = now_unix();
        }
        self.persist_locked()
            .await
            .map_err(|e| ConnectError::BadRequest(e.to_string()))
    }

    pub fn generate_token(&self, username: &str) -> Result<String, ConnectError> {
        self.sign(username, "access", self.access_ttl_secs)
    }

    pub fn generate_refresh_token(&self, username: &str) -> Result<String, ConnectError> {
        self.sign(username, "refresh", self.refresh_ttl_secs)
    }

    /// Issue both tokens for a freshly-authenticated user (login/refresh
    /// response shape, spec §6.1).
    pub fn issue_pair(&self, username: &str) -> Result<TokenPair, ConnectError> {
        Ok(TokenPair {
            token: self.generate_token(username)?,
            refresh_token: self.generate_refresh_token(username)?,
            expires_in: self.access_ttl_secs,
        })
    }

    fn sign(&self, username: &str, typ: &str, ttl_secs: i64) -> Result<String, ConnectError> {
        let now = now_unix();
        let claims = Claims {
            sub: username.to_string(),
            iat: now,
            exp: now + ttl_secs,
            typ: typ.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|_| ConnectError::InvalidToken)
    }

    /// Validate any signed token (access or refresh) and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ConnectError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &validation,
        ) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(ConnectError::TokenExpired),
                _ => Err(ConnectError::InvalidToken),
            },
        }
    }

    /// Redeem a refresh token for a fresh pair. Single-use: a `jti` that has
    /// already been consumed is rejected even if still unexpired.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ConnectError> {
        let claims = self.validate_token(refresh_token)?;
        if claims.typ != "refresh" {
            return Err(ConnectError::InvalidToken);
        }
        {
            let mut consumed = self.consumed_refresh_jti.write().await;
            if !consumed.insert(claims.jti.clone()) {
                return Err(ConnectError::InvalidToken);
            }
        }
        self.issue_pair(&claims.sub)
    }

    async fn persist_locked(&self) -> anyhow::Result<()> {
        let users = self.store.read().await.clone();
        let json = serde_json::to_string_pretty(&CredentialFile { users })?;
        std::fs::write(&self.path, json)?;
        set_owner_only(&self.path);
        Ok(())
    }
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn load_or_generate_secret(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path.exists() {
        return Ok(std::fs::read(path)?);
    }
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    std::fs::write(path, &bytes)?;
    set_owner_only(path);
    Ok(bytes.to_vec())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(windows)]
fn set_owner_only(_path: &Path) {}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> (Authenticator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::load_or_init(dir.path(), Some("test-secret".into()), 1).unwrap();
        (auth, dir)
    }

    #[tokio::test]
    async fn seeds_default_account_when_empty() {
        let (auth, _dir) = authenticator();
        assert!(!auth.has_users().await);
        auth.seed_default_if_empty().await.unwrap();
        assert!(auth.has_users().await);
        auth.authenticate(DEFAULT_USERNAME, DEFAULT_PASSWORD)
            .await
            .unwrap();
        assert!(auth.has_default_credentials().await);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let (auth, _dir) = authenticator();
        let result = auth.authenticate("nobody", "whatever").await;
        assert!(matches!(result, Err(ConnectError::UserNotFound)));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (auth, _dir) = authenticator();
        auth.seed_default_if_empty().await.unwrap();
        let result = auth.authenticate(DEFAULT_USERNAME, "wrong").await;
        assert!(matches!(result, Err(ConnectError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn change_password_invalidates_old_password() {
        let (auth, _dir) = authenticator();
        auth.seed_default_if_empty().await.unwrap();
        auth.update_password(DEFAULT_USERNAME, "new-password")
            .await
            .unwrap();
        assert!(matches!(
            auth.authenticate(DEFAULT_USERNAME, DEFAULT_PASSWORD).await,
            Err(ConnectError::InvalidCredentials)
        ));
        auth.authenticate(DEFAULT_USERNAME, "new-password")
            .await
            .unwrap();
        assert!(!auth.has_default_credentials().await);
    }

    #[tokio::test]
    async fn validate_token_round_trips() {
        let (auth, _dir) = authenticator();
        let token = auth.generate_token("admin").unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.typ, "access");
    }

    #[tokio::test]
    async fn validate_token_rejects_garbage() {
        let (auth, _dir) = authenticator();
        let result = auth.validate_token("not.a.jwt");
        assert!(matches!(result, Err(ConnectError::InvalidToken)));
    }

    #[tokio::test]
    async fn refresh_token_is_single_use() {
        let (auth, _dir) = authenticator();
        let pair = auth.issue_pair("admin").unwrap();
        let second = auth.refresh(&pair.refresh_token).await.unwrap();
        assert!(auth.validate_token(&second.token).is_ok());

        let reuse = auth.refresh(&pair.refresh_token).await;
        assert!(matches!(reuse, Err(ConnectError::InvalidToken)));
    }

    #[tokio::test]
    async fn refresh_rejects_access_token() {
        let (auth, _dir) = authenticator();
        let token = auth.generate_token("admin").unwrap();
        let result = auth.refresh(&token).await;
        assert!(matches!(result, Err(ConnectError::InvalidToken)));
    }
}
