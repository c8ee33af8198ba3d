use anyhow::{Context, Result, anyhow};
use std::env;

/// Relay settings, read from `BIE_*` environment variables at startup.
pub struct Config {
    pub sender_port: u16,
    pub receiver_port: u16,
    pub domain: String,
    pub shard_id: String,
    pub cert_file: String,
    pub key_file: String,
    pub log_type: LogType,
    pub log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogType {
    Text,
    Json,
}

const DEFAULT_CERT_FILE: &str = "/etc/letsencrypt/live/bie.mlops.ninja/fullchain.pem";
const DEFAULT_KEY_FILE: &str = "/etc/letsencrypt/live/bie.mlops.ninja/privkey.pem";

pub fn load_config() -> Result<Config> {
    Ok(Config {
        sender_port: port_from_env("BIE_SENDER_PORT", 443)?,
        receiver_port: port_from_env("BIE_RECEIVER_PORT", 5443)?,
        domain: string_from_env("BIE_DOMAIN", ""),
        shard_id: string_from_env("BIE_SHARD_ID", "01"),
        cert_file: string_from_env("BIE_CERT_FILE", DEFAULT_CERT_FILE),
        key_file: string_from_env("BIE_KEY_FILE", DEFAULT_KEY_FILE),
        log_type: parse_log_type(&string_from_env("BIE_LOG_TYPE", "text"))?,
        log_level: parse_log_level(&string_from_env("BIE_LOG_LEVEL", "info"))?,
    })
}

fn string_from_env(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn port_from_env(name: &str, default: u16) -> Result<u16> {
    match env::var(name) {
        Ok(value) => parse_port(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_port(name: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .with_context(|| format!("{name} is not a valid port number: {value}"))
}

fn parse_log_type(value: &str) -> Result<LogType> {
    match value {
        "text" => Ok(LogType::Text),
        "json" => Ok(LogType::Json),
        other => Err(anyhow!("BIE_LOG_TYPE must be \"text\" or \"json\", got {other}")),
    }
}

fn parse_log_level(value: &str) -> Result<String> {
    match value {
        "debug" | "info" | "warn" | "error" => Ok(value.to_string()),
        other => Err(anyhow!(
            "BIE_LOG_LEVEL must be one of debug, info, warn, error, got {other}"
        )),
    }
}
