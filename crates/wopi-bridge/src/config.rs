//! Process configuration, read once at startup from the environment and a
//! handful of secret files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BridgeError;

const DEFAULT_APP_ROOT: &str = "/wopib";
const DEFAULT_SAVE_INTERVAL: u64 = 200;
const DEFAULT_UNLOCK_INTERVAL: u64 = 90;
const DEFAULT_CERT_PATH: &str = "/var/run/secrets/cert.pem";
const DEFAULT_SECRET_PATH: &str = "/var/run/secrets/wbsecret";
const DEFAULT_APIKEY_DIR: &str = "/var/run/secrets/";
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge-wide settings, resolved once and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub app_root: String,
    pub save_interval: Duration,
    pub unlock_interval: Duration,
    pub skip_ssl_verify: bool,
    pub cert_path: PathBuf,
    pub hash_secret: String,
    pub apikey_dir: PathBuf,
    pub outbound_timeout: Duration,
}

impl BridgeConfig {
    /// Load from the environment and secret files. Any mandatory setting
    /// that is missing or unparsable is a fatal configuration error.
    pub fn load() -> Result<Self, BridgeError> {
        let app_root = env_or("APP_ROOT", DEFAULT_APP_ROOT);
        let app_root = app_root.trim_end_matches('/').to_string();
        let save_interval = env_parsed("APP_SAVE_INTERVAL", DEFAULT_SAVE_INTERVAL)?;
        let unlock_interval = env_parsed("APP_UNLOCK_INTERVAL", DEFAULT_UNLOCK_INTERVAL)?;
        let skip_ssl_verify = env_flag("SKIP_SSL_VERIFY");
        let cert_path = PathBuf::from(env_or("WOPIBRIDGE_CERT_PATH", DEFAULT_CERT_PATH));
        let secret_path = PathBuf::from(env_or("WOPIBRIDGE_SECRET_PATH", DEFAULT_SECRET_PATH));
        let apikey_dir = PathBuf::from(env_or("WOPIBRIDGE_APIKEY_DIR", DEFAULT_APIKEY_DIR));

        let hash_secret = std::fs::read_to_string(&secret_path)
            .map_err(|e| BridgeError::Config(format!("cannot read hash secret at {}: {e}", secret_path.display())))?
            .trim()
            .to_string();
        if hash_secret.is_empty() {
            return Err(BridgeError::Config(format!(
                "hash secret at {} is empty",
                secret_path.display()
            )));
        }

        Ok(Self {
            app_root,
            save_interval: Duration::from_secs(save_interval),
            unlock_interval: Duration::from_secs(unlock_interval),
            skip_ssl_verify,
            cert_path,
            hash_secret,
            apikey_dir,
            outbound_timeout: OUTBOUND_TIMEOUT,
        })
    }

    /// Sibling key file path: the cert path with `cert` replaced by `key`.
    pub fn key_path(&self) -> PathBuf {
        PathBuf::from(self.cert_path.to_string_lossy().replacen("cert", "key", 1))
    }

    pub fn has_tls_cert(&self) -> bool {
        self.cert_path.is_file()
    }

    /// Path to a per-adapter API-key secret file, e.g. `codimd_apikey`.
    pub fn apikey_path(&self, adapter_name: &str) -> PathBuf {
        self.apikey_dir.join(format!("{adapter_name}_apikey"))
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_uppercase().as_str(), "TRUE" | "YES"))
        .unwrap_or(false)
}

fn env_parsed(name: &str, default: u64) -> Result<u64, BridgeError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BridgeError::Config(format!("{name} is not a valid integer: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Read a required secret file's first line, trimmed, for adapter setup.
pub fn read_secret_file(path: &Path) -> Result<String, BridgeError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read secret at {}: {e}", path.display())))?;
    Ok(contents.lines().next().unwrap_or("").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_swaps_cert_for_key() {
        let mut cfg = minimal();
        cfg.cert_path = PathBuf::from("/var/run/secrets/cert.pem");
        assert_eq!(cfg.key_path(), PathBuf::from("/var/run/secrets/key.pem"));
    }

    #[test]
    fn apikey_path_joins_adapter_name() {
        let cfg = minimal();
        assert_eq!(cfg.apikey_path("codimd"), cfg.apikey_dir.join("codimd_apikey"));
    }

    fn minimal() -> BridgeConfig {
        BridgeConfig {
            app_root: "/wopib".into(),
            save_interval: Duration::from_secs(200),
            unlock_interval: Duration::from_secs(90),
            skip_ssl_verify: false,
            cert_path: PathBuf::from(DEFAULT_CERT_PATH),
            hash_secret: "s3cr3t".into(),
            apikey_dir: PathBuf::from(DEFAULT_APIKEY_DIR),
            outbound_timeout: OUTBOUND_TIMEOUT,
        }
    }
}
