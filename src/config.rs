use std::net::SocketAddr;

use anyhow::Context;

const DEFAULT_DATABASE_URL: &str = "sqlite://roomrelay.db?mode=rwc";
const DEFAULT_PORT: u16 = 9011;

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub addr: SocketAddr,
}

impl Config {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();

        let jwt_secret = dotenv::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let database_url = dotenv::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_owned());
        let db_max_connections = parse_or("DB_MAX_CONNECTIONS", 16)?;
        let port: u16 = parse_or("PORT", DEFAULT_PORT)?;
        let bind_addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_owned());

        let addr: SocketAddr = format!("{bind_addr}:{port}")
            .parse()
            .with_context(|| format!("invalid BIND_ADDR {bind_addr:?}"))?;

        Ok(Config {
            jwt_secret,
            database_url,
            db_max_connections,
            addr,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key} {raw:?}")),
        Err(_) => Ok(default),
    }
}
