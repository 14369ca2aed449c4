use crate::util::decode_hex;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PushMode {
    Off,
    Log,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub postgres_dsn: String,
    pub token_seed: Vec<u8>,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
    pub totp_issuer: String,
    pub push: PushMode,
}

/// Loads server configuration from the filesystem with environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("SOTTO_BIND", map.remove("server.bind"))?)?;
    let postgres_dsn = required(override_env(
        "SOTTO_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let token_seed_hex = required(override_env(
        "SOTTO_TOKEN_SEED",
        map.remove("auth.token_seed"),
    )?)?;
    let token_seed = decode_hex(&token_seed_hex).map_err(|_| ConfigError::Invalid)?;
    if token_seed.len() < 32 {
        return Err(ConfigError::Invalid);
    }

    let access_ttl = override_env("SOTTO_ACCESS_TTL", map.remove("auth.access_ttl"))?
        .unwrap_or_else(|| "900".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let refresh_ttl = override_env("SOTTO_REFRESH_TTL", map.remove("auth.refresh_ttl"))?
        .unwrap_or_else(|| "2592000".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    if access_ttl == 0 || refresh_ttl == 0 {
        return Err(ConfigError::Invalid);
    }
    let totp_issuer = override_env("SOTTO_TOTP_ISSUER", map.remove("auth.totp_issuer"))?
        .unwrap_or_else(|| "Sotto".to_string());

    let push_mode = override_env("SOTTO_PUSH_MODE", map.remove("push.mode"))?
        .unwrap_or_else(|| "off".to_string());
    let push = match push_mode.as_str() {
        "off" => PushMode::Off,
        "log" => PushMode::Log,
        _ => return Err(ConfigError::Invalid),
    };

    Ok(ServerConfig {
        bind,
        postgres_dsn,
        token_seed,
        access_ttl_seconds: access_ttl,
        refresh_ttl_seconds: refresh_ttl,
        totp_issuer,
        push,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("sotto_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:8770\"\n[storage]\npostgres_dsn=\"postgres://localhost/sotto\"\n[auth]\ntoken_seed=\"000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8770");
        assert_eq!(config.access_ttl_seconds, 900);
        assert_eq!(config.refresh_ttl_seconds, 2_592_000);
        assert_eq!(config.totp_issuer, "Sotto");
        assert_eq!(config.push, PushMode::Off);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_short_seed() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("sotto_test_config_short_seed.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:8770\"\n[storage]\npostgres_dsn=\"postgres://localhost/sotto\"\n[auth]\ntoken_seed=\"00010203\"\n",
        )
        .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }
}
