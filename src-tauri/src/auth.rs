//! Выдача токенов доступа. Проверка токена происходит на другой стороне.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SECRET_ENV: &str = "JWT_SECRET";
pub const EXPIRES_IN_ENV: &str = "JWT_EXPIRES_IN";

/// Используется, только если секрет не задан в окружении
const DEV_SECRET: &str = "fallback_secret_key";
const DEFAULT_EXPIRES_IN: &str = "7d";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token lifetime `{0}`")]
    InvalidExpiry(String),
    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub id: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenConfig {
    secret: String,
    expires_in: Duration,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            secret: secret.into(),
            expires_in,
        }
    }

    /// Читает `JWT_SECRET` и `JWT_EXPIRES_IN`. Неверный срок не мешает
    /// запуску: берётся срок по умолчанию.
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(SECRET_ENV).ok(),
            std::env::var(EXPIRES_IN_ENV).ok(),
        )
    }

    pub fn from_values(secret: Option<String>, expires_in: Option<String>) -> Self {
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                tracing::warn!("{SECRET_ENV} is not set, signing tokens with the development secret");
                DEV_SECRET.to_string()
            }
        };
        let raw = expires_in.filter(|s| !s.trim().is_empty());
        let parsed = match raw.as_deref().map(parse_expiry) {
            None => None,
            Some(Ok(expires_in)) => Some(expires_in),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "{EXPIRES_IN_ENV} ignored, using {DEFAULT_EXPIRES_IN}");
                None
            }
        };
        let expires_in = parsed.unwrap_or_else(|| Duration::days(7));
        Self::new(secret, expires_in)
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"***")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

const SECOND_MS: f64 = 1000.0;
const MINUTE_MS: f64 = 60.0 * SECOND_MS;
const HOUR_MS: f64 = 60.0 * MINUTE_MS;
const DAY_MS: f64 = 24.0 * HOUR_MS;
const WEEK_MS: f64 = 7.0 * DAY_MS;
const YEAR_MS: f64 = 365.25 * DAY_MS;
// с запасом меньше предела chrono
const MAX_LIFETIME_MS: f64 = 1.0e15;

fn unit_millis(unit: &str) -> Option<f64> {
    let millis = match unit.to_ascii_lowercase().as_str() {
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1.0,
        "" | "s" | "sec" | "secs" | "second" | "seconds" => SECOND_MS,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE_MS,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR_MS,
        "d" | "day" | "days" => DAY_MS,
        "w" | "week" | "weeks" => WEEK_MS,
        "y" | "yr" | "yrs" | "year" | "years" => YEAR_MS,
        _ => return None,
    };
    Some(millis)
}

/// Срок жизни в формате `ms`: `90`, `90s`, `15m`, `2.5h`, `7d`, `7 days`, `1w`, `1y`.
/// Число без единицы означает секунды.
pub fn parse_expiry(raw: &str) -> Result<Duration, AuthError> {
    let invalid = || AuthError::InvalidExpiry(raw.to_string());
    let trimmed = raw.trim();

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let millis = value * unit_millis(unit.trim()).ok_or_else(invalid)?;

    if !(1.0..=MAX_LIFETIME_MS).contains(&millis) {
        return Err(invalid());
    }
    Duration::try_milliseconds(millis.round() as i64).ok_or_else(invalid)
}

pub fn issue_token(subject: &str, config: &TokenConfig) -> Result<String, AuthError> {
    issue_token_at(subject, config, Utc::now())
}

pub fn issue_token_at(subject: &str, config: &TokenConfig, now: DateTime<Utc>) -> Result<String, AuthError> {
    let expires_at = now
        .checked_add_signed(config.expires_in)
        .ok_or_else(|| AuthError::InvalidExpiry(config.expires_in.to_string()))?;
    let claims = Claims {
        id: subject.to_string(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )?;
    tracing::debug!(subject, exp = claims.exp, "token issued");
    Ok(token)
}
