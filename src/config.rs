//! Environment-based configuration helpers

use std::env;

/// Get the current environment (production, sandbox, development)
pub fn get_environment() -> String {
    env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Redis connection URL for the tick cache and pub/sub
pub fn get_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Postgres connection string for the job/agent/entity store.
/// Absent means the server falls back to the in-memory store.
pub fn get_database_url() -> Option<String> {
    env::var("DATABASE_URL").ok()
}

/// Shared secret for user bearer-token verification
pub fn get_auth_secret() -> String {
    env::var("AUTH_SECRET").unwrap_or_else(|_| "dev-secret-change-me".to_string())
}

/// HTTP bind port
pub fn get_port() -> u16 {
    env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}
