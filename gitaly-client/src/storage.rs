//! Storage shard routing: which address and token serve a storage.

use crate::address::GitalyAddress;
use crate::config::{Config, ConfigError};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug)]
struct Storage {
    address: GitalyAddress,
    token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionData {
    pub address: String,
    pub token: String,
}

#[derive(Clone, Debug)]
pub struct Storages {
    storages: HashMap<String, Storage>,
    default_token: Option<String>,
}

impl Storages {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let storages = config
            .storages
            .iter()
            .map(|(name, storage)| {
                let address = storage.gitaly_address.parse().map_err(|source| {
                    ConfigError::InvalidAddress {
                        storage: name.clone(),
                        source,
                    }
                })?;
                let token = storage.gitaly_token.clone().filter(|t| !t.is_empty());

                Ok((name.clone(), Storage { address, token }))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Storages {
            storages,
            default_token: config.gitaly_token.clone(),
        })
    }

    fn get(&self, storage: &str) -> Result<&Storage, ConfigError> {
        self.storages
            .get(storage)
            .ok_or_else(|| ConfigError::UnknownStorage(storage.to_string()))
    }

    pub fn address(&self, storage: &str) -> Result<&GitalyAddress, ConfigError> {
        Ok(&self.get(storage)?.address)
    }

    /// The storage's own token, falling back to the global one.
    pub fn token(&self, storage: &str) -> Result<String, ConfigError> {
        let storage = self.get(storage)?;

        Ok(storage
            .token
            .clone()
            .or_else(|| self.default_token.clone())
            .unwrap_or_default())
    }

    pub fn connection_data(&self, storage: &str) -> Result<ConnectionData, ConfigError> {
        Ok(ConnectionData {
            address: self.address(storage)?.to_string(),
            token: self.token(storage)?,
        })
    }

    /// Base64 JSON `{storage: {address, token}}`, sent with cross-storage calls
    /// so the receiving server can reach the remote storage.
    pub fn address_metadata(&self, storage: &str) -> Result<String, ConfigError> {
        let data = BTreeMap::from([(storage, self.connection_data(storage)?)]);
        let json = serde_json::to_vec(&data).unwrap_or_default();

        Ok(STANDARD.encode(json))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.storages.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::test_config;

    #[test]
    fn test_connection_data() {
        let storages = Storages::from_config(&test_config()).unwrap();

        assert_eq!(
            storages.connection_data("default").unwrap(),
            ConnectionData {
                address: "tcp://localhost:9876".into(),
                token: "secret".into(),
            }
        );

        // Falls back to the global token
        assert_eq!(storages.token("other").unwrap(), "global-token");
    }

    #[test]
    fn test_unknown_storage() {
        let storages = Storages::from_config(&test_config()).unwrap();
        assert!(matches!(
            storages.address("missing"),
            Err(ConfigError::UnknownStorage(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_address_metadata() {
        let storages = Storages::from_config(&test_config()).unwrap();
        let encoded = storages.address_metadata("default").unwrap();
        let decoded: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();

        assert_eq!(
            decoded,
            serde_json::json!({
                "default": {"address": "tcp://localhost:9876", "token": "secret"}
            })
        );
    }

    #[test]
    fn test_invalid_address() {
        let mut config = test_config();
        config
            .storages
            .get_mut("default")
            .unwrap()
            .gitaly_address = "ftp://localhost".into();

        assert!(matches!(
            Storages::from_config(&config),
            Err(ConfigError::InvalidAddress { storage, .. }) if storage == "default"
        ));
    }
}
