use crate::errors::Error;
use crate::wallets::ethereum::EthereumWallet;
use crate::wallets::monero::MoneroWallet;
use crate::wallets::node_wallet::NodeWallet;
use crate::wallets::{CryptoHandler, HandlerRef};
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

#[derive(Debug, Deserialize, Clone)]
pub struct AssetConfig {
    #[serde(rename = "internalAssetID")]
    pub internal_asset_id: i64,
    #[serde(rename = "coinmarketcapAssetID")]
    pub coinmarketcap_asset_id: i64,
    #[serde(rename = "assetName")]
    pub asset_name: String,
    #[serde(rename = "addressRegex")]
    pub address_regex: String,
    #[serde(rename = "assetSign")]
    pub asset_sign: String,
    pub precision: u32,
    #[serde(rename = "confirmationsNeeded")]
    pub confirmations_needed: i64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Pair {
    #[serde(rename = "idFrom")]
    pub id_from: i64,
    #[serde(rename = "idTo")]
    pub id_to: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Route {
    pub pair: Pair,
    pub fee: f64,
    #[serde(rename = "minAmount")]
    pub min_amount: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(rename = "supportedCryptos")]
    pub supported_cryptos: Vec<AssetConfig>,
    pub routes: Vec<Route>,
}

impl Config {
    pub fn asset(&self, internal_id: i64) -> Option<&AssetConfig> {
        self.supported_cryptos
            .iter()
            .find(|c| c.internal_asset_id == internal_id)
    }
}

pub fn load_config(path: &str) -> Result<Config, Error> {
    let file = File::open(path)
        .map_err(|e| Error::General(format!("cannot open config {}: {}", path, e)))?;
    let config: Config = serde_json::from_reader(file)
        .map_err(|e| Error::General(format!("cannot parse config {}: {}", path, e)))?;
    Ok(config)
}

/// Builds the handler map from the config table. Each supported asset name
/// maps to one wallet backend; assets with unknown names or incomplete
/// environment are skipped so a single missing daemon does not take the
/// whole exchange down.
pub fn build_handlers(config: &Config) -> HashMap<i64, HandlerRef> {
    let mut handlers = HashMap::new();
    for crypto in &config.supported_cryptos {
        let handler: Result<Arc<dyn CryptoHandler>, Error> = match crypto.asset_name.as_str() {
            "Bitcoin" => NodeWallet::bitcoin_from_env().map(|w| Arc::new(w) as _),
            "Litecoin" => NodeWallet::litecoin_from_env().map(|w| Arc::new(w) as _),
            "Monero" => MoneroWallet::from_env().map(|w| Arc::new(w) as _),
            "Ethereum" => EthereumWallet::from_env().map(|w| Arc::new(w) as _),
            other => {
                warn!("Unsupported asset {} in config, skipping", other);
                continue;
            }
        };
        match handler {
            Ok(handler) => {
                handlers.insert(crypto.internal_asset_id, HandlerRef::new(handler));
            }
            Err(e) => {
                log_error!("Cannot set up handler for {}: {}", crypto.asset_name, e);
            }
        }
    }
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
      "supportedCryptos": [
        {
          "internalAssetID": 1,
          "coinmarketcapAssetID": 1,
          "assetName": "Bitcoin",
          "addressRegex": "^(bc1|[13])[a-zA-HJ-NP-Z0-9]{25,62}$",
          "assetSign": "BTC",
          "precision": 8,
          "confirmationsNeeded": 1
        },
        {
          "internalAssetID": 2,
          "coinmarketcapAssetID": 2,
          "assetName": "Litecoin",
          "addressRegex": "^(ltc1|[LM3])[a-zA-HJ-NP-Z0-9]{25,62}$",
          "assetSign": "LTC",
          "precision": 8,
          "confirmationsNeeded": 3
        }
      ],
      "routes": [
        { "pair": { "idFrom": 1, "idTo": 2 }, "fee": 0.01, "minAmount": 0.001 }
      ]
    }"#;

    #[test]
    fn parses_config_document() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.supported_cryptos.len(), 2);
        assert_eq!(config.routes.len(), 1);
        let btc = config.asset(1).unwrap();
        assert_eq!(btc.asset_name, "Bitcoin");
        assert_eq!(btc.coinmarketcap_asset_id, 1);
        assert_eq!(btc.confirmations_needed, 1);
        let route = &config.routes[0];
        assert_eq!(route.pair.id_from, 1);
        assert_eq!(route.pair.id_to, 2);
        assert!((route.fee - 0.01).abs() < 1e-12);
        assert!((route.min_amount - 0.001).abs() < 1e-12);
        assert!(config.asset(9).is_none());
    }
}
