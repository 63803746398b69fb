use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;

use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_cert::name::Name;

use crate::crl::IssuingPointConfig;

#[derive(Error, Debug)]
pub enum AppConfigError {
    #[error("Invalid issuer name '{0}': {1}")]
    Issuer(String, String),

    #[error("Invalid authority key identifier: {0}")]
    AuthorityKeyId(#[from] hex::FromHexError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ca: CaSettings,
    #[serde(default)]
    pub issuing_points: BTreeMap<String, IssuingPointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaSettings {
    /// Issuer distinguished name in RFC 4514 form.
    pub issuer: String,
    /// Hex-encoded key identifier for the AuthorityKeyIdentifier extension.
    #[serde(default)]
    pub authority_key_id: Option<String>,
    /// PEM private key; an ephemeral RSA key is generated when unset.
    #[serde(default)]
    pub signing_key: Option<PathBuf>,
    pub record_dir: PathBuf,
    pub publish_dir: PathBuf,
}

impl CaSettings {
    pub fn issuer_name(&self) -> Result<Name, AppConfigError> {
        Name::from_str(&self.issuer)
            .map_err(|e| AppConfigError::Issuer(self.issuer.clone(), e.to_string()))
    }

    pub fn authority_key_id(&self) -> Result<Option<Vec<u8>>, AppConfigError> {
        self.authority_key_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(hex::decode)
            .transpose()
            .map_err(Into::into)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("ca.issuer", "CN=Certificate Authority")?
            .set_default("ca.record_dir", "data/records")?
            .set_default("ca.publish_dir", "data/crl")?
            .add_source(File::with_name("config/settings").required(false));

        // Explicit overrides keep tests independent of the process environment
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Format: APP_CA__ISSUER or APP_ISSUING_POINTS__MASTER__UPDATE_SCHEMA
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
