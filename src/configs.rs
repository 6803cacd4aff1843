use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::CaIdentity;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ca_identity: CaIdentityDefaults,
    #[serde(default)]
    pub validity: ValidityConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("ca")
}

fn default_lock_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaIdentityDefaults {
    #[serde(default = "default_root_ca_cn")]
    pub common_name: String,
    #[serde(default = "default_root_ca_org")]
    pub organization: String,
    #[serde(default = "default_root_ca_ou")]
    pub organizational_unit: String,
    #[serde(default = "default_root_ca_country")]
    pub country: String,
    #[serde(default = "default_root_ca_state")]
    pub state: String,
    #[serde(default = "default_root_ca_locality")]
    pub locality: String,
    #[serde(default = "default_root_ca_email")]
    pub email: String,
}

impl Default for CaIdentityDefaults {
    fn default() -> Self {
        Self {
            common_name: default_root_ca_cn(),
            organization: default_root_ca_org(),
            organizational_unit: default_root_ca_ou(),
            country: default_root_ca_country(),
            state: default_root_ca_state(),
            locality: default_root_ca_locality(),
            email: default_root_ca_email(),
        }
    }
}

impl CaIdentityDefaults {
    pub fn to_identity(&self) -> CaIdentity {
        CaIdentity {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
            country: self.country.clone(),
            state: self.state.clone(),
            locality: self.locality.clone(),
            email: self.email.clone(),
        }
    }
}

fn default_root_ca_cn() -> String {
    "S/MIME Root CA".to_string()
}

fn default_root_ca_org() -> String {
    "Example Org".to_string()
}

fn default_root_ca_ou() -> String {
    "Mail Security".to_string()
}

fn default_root_ca_country() -> String {
    "US".to_string()
}

fn default_root_ca_state() -> String {
    "California".to_string()
}

fn default_root_ca_locality() -> String {
    "San Francisco".to_string()
}

fn default_root_ca_email() -> String {
    "ca@example.com".to_string()
}

/// Root and leaf validity are independent settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ValidityConfig {
    #[serde(default = "default_root_days")]
    pub root_days: u32,
    #[serde(default = "default_leaf_days")]
    pub leaf_days: u32,
}

impl Default for ValidityConfig {
    fn default() -> Self {
        Self {
            root_days: default_root_days(),
            leaf_days: default_leaf_days(),
        }
    }
}

fn default_root_days() -> u32 {
    3650 // 10 years
}

fn default_leaf_days() -> u32 {
    365
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeyConfig {
    #[serde(default = "default_leaf_bits")]
    pub leaf_bits: u32,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            leaf_bits: default_leaf_bits(),
        }
    }
}

fn default_leaf_bits() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct BundleConfig {
    /// Environment variable holding the PKCS#12 export password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            password_env: default_password_env(),
        }
    }
}

fn default_password_env() -> String {
    "SMIME_CA_BUNDLE_PASSWORD".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to built-in defaults when the
    /// default config file is absent
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.store.path, PathBuf::from("ca"));
        assert_eq!(config.validity.root_days, 3650);
        assert_eq!(config.validity.leaf_days, 365);
        assert_eq!(config.keys.leaf_bits, 2048);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn partial_sections_override_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [store]
            path = "/var/lib/smime-ca"

            [ca_identity]
            organization = "ACME Corp"
            country = "DE"

            [validity]
            leaf_days = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/smime-ca"));
        assert_eq!(config.store.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.validity.leaf_days, 30);
        assert_eq!(config.validity.root_days, 3650);

        let identity = config.ca_identity.to_identity();
        assert_eq!(identity.organization, "ACME Corp");
        assert_eq!(identity.country, "DE");
        assert_eq!(identity.organizational_unit, "Mail Security");
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert!(AppConfig::from_toml_str("[validity]\nroot_days = \"ten\"").is_err());
    }
}
