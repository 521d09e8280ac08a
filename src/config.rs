//! Application configuration
//! Mission: load environment configuration and refuse to start unsafely in production.

use anyhow::{bail, Result};
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub database_path: String,
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
    pub jwt_secret_key: String,
    pub phi_hash_salt: String,
    pub require_auth: bool,
    pub cors_origins: Vec<String>,
    pub rate_limit_require_redis: bool,
    pub port: u16,
    pub worker_pool_size: usize,
    pub streaming_threshold_bytes: u64,
    pub job_soft_deadline_secs: u64,
    pub job_hard_deadline_secs: u64,
    pub cache_ttl_claim_secs: u64,
    pub cache_ttl_risk_score_secs: u64,
    pub cache_ttl_payer_secs: u64,
    pub cache_ttl_count_secs: u64,
}

const DEFAULT_SECRETS: &[&str] = &[
    "dev-secret-change-in-production-minimum-32-characters",
    "changeme",
    "secret",
];

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let environment = Environment::from_str(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        );

        let database_path =
            env::var("DATABASE_URL").unwrap_or_else(|_| "./claimguard.db".to_string());
        let redis_url = env::var("REDIS_URL").ok();
        let redis_password = env::var("REDIS_PASSWORD").ok();

        let jwt_secret_key = env::var("JWT_SECRET_KEY")
            .unwrap_or_else(|_| DEFAULT_SECRETS[0].to_string());

        let phi_hash_salt = env::var("PHI_HASH_SALT")
            .unwrap_or_else(|_| DEFAULT_SECRETS[0].to_string());

        let require_auth = env::var("REQUIRE_AUTH")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or_else(|_| environment.is_production());

        let cors_origins: Vec<String> = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let rate_limit_require_redis = env::var("RATE_LIMIT_REQUIRE_REDIS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or_else(|_| environment.is_production());

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let worker_pool_size = env::var("WORKER_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        let streaming_threshold_bytes = env::var("STREAMING_THRESHOLD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10 * 1024 * 1024);

        let job_soft_deadline_secs = env::var("JOB_SOFT_DEADLINE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        let job_hard_deadline_secs = env::var("JOB_HARD_DEADLINE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(job_soft_deadline_secs * 2);

        let cache_ttl_claim_secs = env::var("CACHE_TTL_CLAIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        let cache_ttl_risk_score_secs = env::var("CACHE_TTL_RISK_SCORE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        let cache_ttl_payer_secs = env::var("CACHE_TTL_PAYER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86_400);
        let cache_ttl_count_secs = env::var("CACHE_TTL_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let config = Self {
            environment,
            database_path,
            redis_url,
            redis_password,
            jwt_secret_key,
            phi_hash_salt,
            require_auth,
            cors_origins,
            rate_limit_require_redis,
            port,
            worker_pool_size,
            streaming_threshold_bytes,
            job_soft_deadline_secs,
            job_hard_deadline_secs,
            cache_ttl_claim_secs,
            cache_ttl_risk_score_secs,
            cache_ttl_payer_secs,
            cache_ttl_count_secs,
        };

        config.validate_production_safety()?;
        Ok(config)
    }

    fn validate_production_safety(&self) -> Result<()> {
        if !self.environment.is_production() {
            return Ok(());
        }

        if self.jwt_secret_key.len() < 32 || DEFAULT_SECRETS.contains(&self.jwt_secret_key.as_str())
        {
            bail!("JWT_SECRET_KEY must be >= 32 chars and not a known default in production");
        }

        if self.phi_hash_salt.len() < 32 || DEFAULT_SECRETS.contains(&self.phi_hash_salt.as_str())
        {
            bail!("PHI_HASH_SALT must be >= 32 chars and not a known default in production");
        }

        if self.cors_origins.is_empty() {
            bail!("CORS_ORIGINS must be set explicitly in production");
        }

        for origin in &self.cors_origins {
            if origin == "*" {
                bail!("CORS_ORIGINS must not contain a wildcard in production");
            }
            if origin.contains("localhost") || origin.contains("127.0.0.1") {
                bail!("CORS_ORIGINS must not contain localhost in production");
            }
            if !origin.starts_with("https://") {
                bail!("CORS_ORIGINS must be HTTPS-only in production: {origin}");
            }
        }

        if self.rate_limit_require_redis && self.redis_url.is_none() {
            bail!("RATE_LIMIT_REQUIRE_REDIS is set but REDIS_URL is missing in production");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            environment: Environment::Production,
            database_path: "db".into(),
            redis_url: Some("redis://localhost".into()),
            redis_password: None,
            jwt_secret_key: "a".repeat(40),
            phi_hash_salt: "b".repeat(40),
            require_auth: true,
            cors_origins: vec!["https://app.example.com".into()],
            rate_limit_require_redis: true,
            port: 8080,
            worker_pool_size: 4,
            streaming_threshold_bytes: 10 * 1024 * 1024,
            job_soft_deadline_secs: 300,
            job_hard_deadline_secs: 600,
            cache_ttl_claim_secs: 300,
            cache_ttl_risk_score_secs: 3600,
            cache_ttl_payer_secs: 86_400,
            cache_ttl_count_secs: 60,
        }
    }

    #[test]
    fn production_rejects_default_secret() {
        let mut c = base_config();
        c.jwt_secret_key = "dev-secret-change-in-production-minimum-32-characters".into();
        assert!(c.validate_production_safety().is_err());
    }

    #[test]
    fn production_rejects_short_secret() {
        let mut c = base_config();
        c.jwt_secret_key = "short".into();
        assert!(c.validate_production_safety().is_err());
    }

    #[test]
    fn production_rejects_wildcard_cors() {
        let mut c = base_config();
        c.cors_origins = vec!["*".into()];
        assert!(c.validate_production_safety().is_err());
    }

    #[test]
    fn production_rejects_localhost_cors() {
        let mut c = base_config();
        c.cors_origins = vec!["https://localhost:3000".into()];
        assert!(c.validate_production_safety().is_err());
    }

    #[test]
    fn production_rejects_http_cors() {
        let mut c = base_config();
        c.cors_origins = vec!["http://app.example.com".into()];
        assert!(c.validate_production_safety().is_err());
    }

    #[test]
    fn production_accepts_valid_config() {
        let c = base_config();
        assert!(c.validate_production_safety().is_ok());
    }

    #[test]
    fn development_skips_validation() {
        let mut c = base_config();
        c.environment = Environment::Development;
        c.jwt_secret_key = "short".into();
        c.cors_origins = vec!["*".into()];
        assert!(c.validate_production_safety().is_ok());
    }
}
