use crate::{StoreError, StoreResult};
use dotenvy::dotenv;
use lazy_static::lazy_static;
use std::env;

lazy_static! {
    // Load .env once per process, before the first environment read.
    static ref DOTENV_LOADED: () = {
        let _ = dotenv();
    };
}

/// Connection settings for the Postgres store, read from the environment.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    /// Reads `DATABASE_URL` (required) plus the optional
    /// `FLUJO_MIN_CONNECTIONS` / `FLUJO_MAX_CONNECTIONS` pool bounds.
    pub fn from_env() -> StoreResult<Self> {
        lazy_static::initialize(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL")
            .map_err(|_| StoreError::Configuration("DATABASE_URL is not set".to_string()))?;
        Ok(Self {
            url,
            min_connections: pool_bound("FLUJO_MIN_CONNECTIONS", 2)?,
            max_connections: pool_bound("FLUJO_MAX_CONNECTIONS", 16)?,
        })
    }
}

fn pool_bound(name: &str, default: u32) -> StoreResult<u32> {
    match env::var(name) {
        Ok(raw) => raw.parse::<u32>().map_err(|_| {
            StoreError::Configuration(format!("{} must be a number, got {:?}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
