//! Live price table and the conversion engine.
//!
//! The feed task writes prices keyed by the aggregator's external asset id;
//! everything else reads by internal id. Fees and minimums come from the
//! config document and never change at runtime.

use crate::config::Config;
use crate::errors::Error;
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct PriceStore {
    prices: RwLock<HashMap<i64, f64>>,
    external_to_internal: HashMap<i64, i64>,
    internal_to_external: HashMap<i64, i64>,
    asset_names: HashMap<i64, String>,
    conversion_fees: HashMap<(i64, i64), f64>,
    min_amounts: HashMap<(i64, i64), f64>,
}

impl PriceStore {
    pub fn new(config: &Config) -> PriceStore {
        let mut store = PriceStore {
            prices: RwLock::new(HashMap::new()),
            external_to_internal: HashMap::new(),
            internal_to_external: HashMap::new(),
            asset_names: HashMap::new(),
            conversion_fees: HashMap::new(),
            min_amounts: HashMap::new(),
        };
        for crypto in &config.supported_cryptos {
            store
                .external_to_internal
                .insert(crypto.coinmarketcap_asset_id, crypto.internal_asset_id);
            store
                .internal_to_external
                .insert(crypto.internal_asset_id, crypto.coinmarketcap_asset_id);
            store
                .asset_names
                .insert(crypto.internal_asset_id, crypto.asset_name.clone());
        }
        for route in &config.routes {
            let key = (route.pair.id_from, route.pair.id_to);
            store.conversion_fees.insert(key, route.fee);
            store.min_amounts.insert(key, route.min_amount);
        }
        store
    }

    /// Writes the latest quote for an external asset id. Ids the config does
    /// not know are dropped, which decouples the feed subscription from
    /// config drift.
    pub fn update(&self, external_id: i64, price: f64) {
        if let Some(internal_id) = self.external_to_internal.get(&external_id) {
            self.prices.write().insert(*internal_id, price);
        }
    }

    pub fn get(&self, internal_id: i64) -> Option<f64> {
        self.prices.read().get(&internal_id).cloned()
    }

    pub fn get_fee(&self, from_id: i64, to_id: i64) -> Option<f64> {
        self.conversion_fees.get(&(from_id, to_id)).cloned()
    }

    pub fn get_min_amount(&self, from_id: i64, to_id: i64) -> Option<f64> {
        self.min_amounts.get(&(from_id, to_id)).cloned()
    }

    pub fn asset_name(&self, internal_id: i64) -> String {
        self.asset_names
            .get(&internal_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn external_ids(&self) -> Vec<i64> {
        self.internal_to_external.values().cloned().collect()
    }
}

pub fn convert(store: &PriceStore, from_id: i64, to_id: i64, amount: f64) -> Result<f64, Error> {
    let from_price = store
        .get(from_id)
        .ok_or_else(|| Error::PriceNotAvailable(store.asset_name(from_id)))?;
    let to_price = store
        .get(to_id)
        .ok_or_else(|| Error::PriceNotAvailable(store.asset_name(to_id)))?;
    let fee = store
        .get_fee(from_id, to_id)
        .ok_or_else(|| Error::FeeNotFound(store.asset_name(from_id), store.asset_name(to_id)))?;

    let usd_value = amount * from_price;
    let usd_value_after_fee = usd_value * (1.0 - fee);
    Ok(usd_value_after_fee / to_price)
}

pub fn convert_without_fee(
    store: &PriceStore,
    from_id: i64,
    to_id: i64,
    amount: f64,
) -> Result<f64, Error> {
    let from_price = store
        .get(from_id)
        .ok_or_else(|| Error::PriceNotAvailable(store.asset_name(from_id)))?;
    let to_price = store
        .get(to_id)
        .ok_or_else(|| Error::PriceNotAvailable(store.asset_name(to_id)))?;
    Ok(amount * from_price / to_price)
}
