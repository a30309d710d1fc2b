use std::{env, str::FromStr, time::Duration};

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub openai_temperature: f32,
    pub completion_timeout: Duration,
    pub api_key_prefix: String,
    pub history_window: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let openai_api_key = var("OPENAI_API_KEY")
            .ok_or_else(|| AppError::config("OPENAI_API_KEY must be set"))?;

        Ok(Self {
            port: parse_or(&var, "PORT", 4000)?,
            database_url: resolve_database_url(&var),
            database_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
            openai_api_key,
            openai_model: var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            openai_temperature: parse_or(&var, "OPENAI_TEMPERATURE", 0.7)?,
            completion_timeout: Duration::from_secs(parse_or(&var, "COMPLETION_TIMEOUT_SECS", 30)?),
            api_key_prefix: var("API_KEY_PREFIX").unwrap_or_else(|| "whrf_pk_".to_string()),
            history_window: parse_or(&var, "HISTORY_WINDOW", 10)?,
        })
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

fn resolve_database_url(var: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(url) = var("DATABASE_URL") {
        return url;
    }
    let host = var("POSTGRES_HOST")
        .or_else(|| var("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = var("POSTGRES_PORT")
        .or_else(|| var("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = var("POSTGRES_USER")
        .or_else(|| var("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = var("POSTGRES_PASSWORD")
        .or_else(|| var("PGPASSWORD"))
        .unwrap_or_default();
    let db = var("POSTGRES_DB")
        .or_else(|| var("PGDATABASE"))
        .unwrap_or_else(|| "storefront_assistant".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
