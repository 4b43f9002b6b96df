//! Authentication
//!
//! User registration and login. Password hashing is an explicit call made
//! here before persistence, not a storage lifecycle hook; sessions are
//! stateless JWTs carried in the Authorization header, so logout is purely
//! client-side.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Minimum password length accepted at registration.
const MIN_PASSWORD_LEN: usize = 8;

/// Attempts at drawing an unused account number before giving up.
const ACCOUNT_NUMBER_ATTEMPTS: u32 = 10;

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiration (unix seconds)
    pub exp: usize,
    /// Issued at (unix seconds)
    pub iat: usize,
}

/// Registration input (validated request body)
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterInput {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

/// Successful registration or login
#[derive(Debug, Clone, Serialize)]
pub struct AuthOutcome {
    pub token: String,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub account_number: String,
}

/// User profile with account summary
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub account_id: Uuid,
    pub account_number: String,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Email already registered")]
    EmailTaken,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Could not allocate an account number")]
    AccountNumberExhausted,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Hash a password with argon2id and a fresh salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored argon2 hash.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<(), AuthError> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| AuthError::Hashing(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AuthError::InvalidCredentials)
}

/// Issue an HS256 JWT for a user.
pub fn issue_token(user_id: Uuid, secret: &str, ttl_hours: i64) -> Result<String, AuthError> {
    let now = Utc::now();
    let expiration = now + Duration::hours(ttl_hours);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration.timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Verify a JWT and return the authenticated user id.
pub fn verify_token(token: &str, secret: &str) -> Result<Uuid, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;

    Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidCredentials)
}

/// Draw a random 10-digit account number.
fn random_account_number() -> String {
    rand::thread_rng()
        .gen_range(1_000_000_000u64..=9_999_999_999u64)
        .to_string()
}

/// Authentication service over the users and accounts tables.
#[derive(Debug, Clone)]
pub struct AuthService {
    pool: PgPool,
    jwt_secret: String,
    token_ttl_hours: i64,
}

impl AuthService {
    pub fn new(pool: PgPool, jwt_secret: String, token_ttl_hours: i64) -> Self {
        Self {
            pool,
            jwt_secret,
            token_ttl_hours,
        }
    }

    /// Register a new user and their wallet account.
    ///
    /// The user row and the account row are written in one transaction so a
    /// user never exists without an account.
    pub async fn register(&self, input: RegisterInput) -> Result<AuthOutcome, AuthError> {
        let email = input.email.trim().to_lowercase();
        validate_registration(&input, &email)?;

        let password_hash = hash_password(&input.password)?;

        let account_number = self.allocate_account_number().await?;
        let user_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (id, first_name, last_name, email, password_hash, is_active)
            VALUES ($1, $2, $3, $4, $5, true)
            "#,
        )
        .bind(user_id)
        .bind(input.first_name.trim())
        .bind(input.last_name.trim())
        .bind(&email)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => AuthError::EmailTaken,
            _ => AuthError::Database(e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO accounts (id, owner_id, account_number, balance, version, is_active)
            VALUES ($1, $2, $3, 0, 1, true)
            "#,
        )
        .bind(account_id)
        .bind(user_id)
        .bind(&account_number)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(%user_id, %account_id, "user registered");

        let token = issue_token(user_id, &self.jwt_secret, self.token_ttl_hours)?;

        Ok(AuthOutcome {
            token,
            user_id,
            account_id,
            account_number,
        })
    }

    /// Verify credentials and issue a token.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthOutcome, AuthError> {
        let email = email.trim().to_lowercase();

        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT id, password_hash FROM users WHERE email = $1 AND is_active",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;

        let (user_id, password_hash) = row.ok_or(AuthError::InvalidCredentials)?;
        verify_password(password, &password_hash)?;

        let (account_id, account_number): (Uuid, String) = sqlx::query_as(
            "SELECT id, account_number FROM accounts WHERE owner_id = $1 AND is_active",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let token = issue_token(user_id, &self.jwt_secret, self.token_ttl_hours)?;

        Ok(AuthOutcome {
            token,
            user_id,
            account_id,
            account_number,
        })
    }

    /// Load the authenticated user's profile with their account summary.
    pub async fn profile(&self, user_id: Uuid) -> Result<Profile, AuthError> {
        let row: Option<(Uuid, String, String, String, Uuid, String, i64, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT u.id, u.first_name, u.last_name, u.email,
                       a.id, a.account_number, a.balance, u.created_at
                FROM users u
                JOIN accounts a ON a.owner_id = u.id AND a.is_active
                WHERE u.id = $1 AND u.is_active
                "#,
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let (user_id, first_name, last_name, email, account_id, account_number, balance, created_at) =
            row.ok_or_else(|| AuthError::UserNotFound(user_id.to_string()))?;

        Ok(Profile {
            user_id,
            first_name,
            last_name,
            email,
            account_id,
            account_number,
            balance,
            created_at,
        })
    }

    /// Verify a bearer token against this service's secret.
    pub fn authenticate(&self, token: &str) -> Result<Uuid, AuthError> {
        verify_token(token, &self.jwt_secret)
    }

    /// Draw account numbers until one is unused.
    async fn allocate_account_number(&self) -> Result<String, AuthError> {
        for _ in 0..ACCOUNT_NUMBER_ATTEMPTS {
            let candidate = random_account_number();

            let taken: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM accounts WHERE account_number = $1)",
            )
            .bind(&candidate)
            .fetch_one(&self.pool)
            .await?;

            if !taken {
                return Ok(candidate);
            }
        }

        Err(AuthError::AccountNumberExhausted)
    }
}

fn validate_registration(input: &RegisterInput, email: &str) -> Result<(), AuthError> {
    if input.first_name.trim().is_empty() {
        return Err(AuthError::InvalidRegistration(
            "first name is required".to_string(),
        ));
    }
    if input.last_name.trim().is_empty() {
        return Err(AuthError::InvalidRegistration(
            "last name is required".to_string(),
        ));
    }
    if !email.contains('@') || email.len() < 3 {
        return Err(AuthError::InvalidRegistration("invalid email".to_string()));
    }
    if input.password.len() < MIN_PASSWORD_LEN {
        return Err(AuthError::InvalidRegistration(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}
