//! Privacy-coin backend: split daemon + wallet RPC behind digest auth.
//! Amounts cross the wire in atomic units (1e12 per coin) and are converted
//! to whole units at this boundary.

use crate::clients::{rpc_call, RpcAuth};
use crate::errors::Error;
use crate::wallets::{CryptoAddress, CryptoHandler, CryptoTransaction, Explorer};
use chrono::Utc;
use futures::future::{self, Future};
use serde_json::{json, Value};

pub const XMR_EXPLORERS: &[Explorer] = &[Explorer {
    name: "localmonero",
    icon_path: "/styles/localmonero.png",
    url_prefix: "https://localmonero.co/blocks/tx/",
}];

const ATOMIC_UNITS: f64 = 1e12;

#[derive(Clone)]
pub struct MoneroWallet {
    node_host: String,
    wallet_host: String,
    auth: RpcAuth,
    wallet: String,
}

impl MoneroWallet {
    pub fn from_env() -> Result<MoneroWallet, Error> {
        Ok(MoneroWallet::new(
            &super::env_var("XMR_NODE_HOST")?,
            &super::env_var("XMR_WALLET_HOST")?,
            &super::env_var("XMR_RPC_USER")?,
            &super::env_var("XMR_RPC_PASS")?,
            &super::env_var("XMR_WALLET_NAME")?,
        ))
    }

    pub fn new(
        node_host: &str,
        wallet_host: &str,
        user: &str,
        pass: &str,
        wallet: &str,
    ) -> MoneroWallet {
        MoneroWallet {
            node_host: node_host.trim_end_matches('/').to_owned(),
            wallet_host: wallet_host.trim_end_matches('/').to_owned(),
            auth: RpcAuth::Digest {
                username: user.to_owned(),
                password: pass.to_owned(),
            },
            wallet: wallet.to_owned(),
        }
    }

    fn node_call(
        &self,
        method: &str,
        params: Value,
    ) -> Box<dyn Future<Item = Value, Error = Error>> {
        let url = format!("http://{}/json_rpc", self.node_host);
        rpc_call(&url, &self.auth, rpc_body(method, params))
    }

    fn wallet_call(
        &self,
        method: &str,
        params: Value,
    ) -> Box<dyn Future<Item = Value, Error = Error>> {
        let url = format!("http://{}/json_rpc", self.wallet_host);
        rpc_call(&url, &self.auth, rpc_body(method, params))
    }
}

fn rpc_body(method: &str, params: Value) -> Value {
    json!({
        "id": "xmr-handler",
        "method": method,
        "params": params,
    })
}

fn atomic_to_whole(atomic: f64) -> f64 {
    atomic / ATOMIC_UNITS
}

fn whole_to_atomic(whole: f64) -> u64 {
    (whole * ATOMIC_UNITS).round() as u64
}

/// Earliest incoming transfer to the subaddress since the marker, converted
/// to whole units.
fn earliest_transfer(entries: &[Value], address: &str, since: i64) -> Option<CryptoTransaction> {
    let mut relevant: Vec<(i64, CryptoTransaction)> = Vec::new();
    for entry in entries {
        let kind = entry.get("type").and_then(Value::as_str).unwrap_or("");
        let tx_address = entry.get("address").and_then(Value::as_str).unwrap_or("");
        if kind != "in" || tx_address != address {
            continue;
        }
        let timestamp = match entry.get("timestamp").and_then(Value::as_i64) {
            Some(t) => t,
            None => continue,
        };
        if timestamp < since {
            continue;
        }
        let confirmations = entry
            .get("confirmations")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let amount = entry.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
        let txid = entry
            .get("txid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        relevant.push((
            timestamp,
            CryptoTransaction {
                txid,
                confirmations,
                amount: atomic_to_whole(amount),
                explorers: XMR_EXPLORERS,
            },
        ));
    }
    relevant.sort_by_key(|(timestamp, _)| *timestamp);
    relevant.into_iter().next().map(|(_, tx)| tx)
}

impl CryptoHandler for MoneroWallet {
    fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        let this = self.clone();
        Box::new(
            self.node_call("get_version", json!({}))
                .and_then(move |_| {
                    let create = this.clone();
                    this.wallet_call("open_wallet", json!({ "filename": this.wallet }))
                        .map(|_| ())
                        .or_else(move |e| {
                            let text = s!(e);
                            if text.contains("file not found") {
                                future::Either::A(
                                    create
                                        .wallet_call(
                                            "create_wallet",
                                            json!({
                                                "filename": create.wallet,
                                                "language": "English",
                                            }),
                                        )
                                        .map(|_| ()),
                                )
                            } else if text.contains("is opened") {
                                future::Either::B(future::ok(()))
                            } else {
                                future::Either::B(future::err(e))
                            }
                        })
                }),
        )
    }

    fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
        Box::new(
            self.wallet_call("create_address", json!({ "account_index": 0 }))
                .and_then(|result| {
                    let address = result
                        .get("address")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            Error::WalletAPIError(s!(
                                "unexpected response format from create_address"
                            ))
                        })?
                        .to_owned();
                    Ok(CryptoAddress {
                        address,
                        start_marker: Utc::now().timestamp(),
                    })
                }),
        )
    }

    fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>> {
        Box::new(
            self.wallet_call("get_balance", json!({ "account_index": 0 }))
                .map_err(|e| Error::WalletAPIError(format!("failed to get balance: {}", e)))
                .and_then(|result| {
                    let atomic = result
                        .get("unlocked_balance")
                        .and_then(Value::as_f64)
                        .ok_or_else(|| {
                            Error::WalletAPIError(s!("unexpected response format from get_balance"))
                        })?;
                    Ok(atomic_to_whole(atomic))
                }),
        )
    }

    fn get_address_transaction(
        &self,
        address: &CryptoAddress,
    ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
        let address = address.clone();
        Box::new(
            self.wallet_call("get_transfers", json!({ "in": true, "account_index": 0 }))
                .and_then(move |result| {
                    let entries = match result.get("in").and_then(Value::as_array) {
                        Some(entries) => entries.as_slice(),
                        // No inbound transfers at all yet.
                        None => &[],
                    };
                    Ok(earliest_transfer(
                        entries,
                        &address.address,
                        address.start_marker,
                    ))
                }),
        )
    }

    fn get_transaction_details(
        &self,
        txid: &str,
    ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
        let txid = txid.to_owned();
        Box::new(
            self.wallet_call(
                "get_transfer_by_txid",
                json!({ "txid": txid.clone(), "account_index": 0 }),
            )
            .and_then(move |result| {
                let transfer = result.get("transfer").ok_or_else(|| {
                    Error::WalletAPIError(s!("unexpected response format from get_transfer_by_txid"))
                })?;
                let confirmations = transfer
                    .get("confirmations")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let amount = transfer.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
                Ok(CryptoTransaction {
                    txid,
                    confirmations,
                    amount: atomic_to_whole(amount),
                    explorers: XMR_EXPLORERS,
                })
            }),
        )
    }

    fn send(
        &self,
        address: &CryptoAddress,
        amount: f64,
    ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
        Box::new(
            self.wallet_call(
                "transfer",
                json!({
                    "destinations": [{
                        "amount": whole_to_atomic(amount),
                        "address": address.address,
                    }],
                    "account_index": 0,
                    "subtract_fee_from_outputs": [0],
                    "priority": 2,
                    "ring_size": 16,
                    "unlock_time": 0,
                }),
            )
            .and_then(|result| {
                let txid = result
                    .get("tx_hash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::WalletAPIError(s!("unexpected response format from transfer"))
                    })?
                    .to_owned();
                Ok(vec![txid])
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_unit_scaling() {
        assert_eq!(atomic_to_whole(2_500_000_000_000.0), 2.5);
        assert_eq!(whole_to_atomic(2.5), 2_500_000_000_000);
        assert_eq!(whole_to_atomic(0.000000000001), 1);
    }

    #[test]
    fn picks_earliest_incoming_transfer() {
        let entries: Vec<Value> = serde_json::from_str(
            r#"[
              {"type": "out", "address": "sub1", "timestamp": 150, "amount": 1e12,
               "confirmations": 3, "txid": "out"},
              {"type": "in", "address": "sub2", "timestamp": 150, "amount": 1e12,
               "confirmations": 3, "txid": "other-address"},
              {"type": "in", "address": "sub1", "timestamp": 80, "amount": 3e12,
               "confirmations": 10, "txid": "pre-marker"},
              {"type": "in", "address": "sub1", "timestamp": 140, "amount": 2.5e12,
               "confirmations": 2, "txid": "winner"},
              {"type": "in", "address": "sub1", "timestamp": 200, "amount": 1e12,
               "confirmations": 0, "txid": "late"}
            ]"#,
        )
        .unwrap();
        let tx = earliest_transfer(&entries, "sub1", 100).unwrap();
        assert_eq!(tx.txid, "winner");
        assert_eq!(tx.amount, 2.5);
        assert_eq!(tx.confirmations, 2);
        assert!(earliest_transfer(&entries, "sub1", 500).is_none());
    }
}
