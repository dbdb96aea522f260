//! UTXO node-wallet backend: a JSON-RPC 1.0 daemon hosting a named wallet,
//! basic auth, per-wallet calls on `/wallet/<name>`. Bitcoin and Litecoin
//! daemons speak the same dialect and differ only in endpoints and
//! explorers.

use crate::clients::{rpc_call, RpcAuth};
use crate::errors::Error;
use crate::wallets::{round_to_digits, CryptoAddress, CryptoHandler, CryptoTransaction, Explorer};
use chrono::Utc;
use futures::future::{self, Future};
use serde_json::{json, Value};

pub const BTC_EXPLORERS: &[Explorer] = &[
    Explorer {
        name: "mempool",
        icon_path: "/styles/mempool.png",
        url_prefix: "https://mempool.space/tx/",
    },
    Explorer {
        name: "blockstream",
        icon_path: "/styles/blockstream.png",
        url_prefix: "https://blockstream.info/tx/",
    },
];

pub const LTC_EXPLORERS: &[Explorer] = &[Explorer {
    name: "litecoinspace",
    icon_path: "/styles/litecoinspace.png",
    url_prefix: "https://litecoinspace.org/tx/",
}];

#[derive(Clone)]
pub struct NodeWallet {
    host: String,
    auth: RpcAuth,
    wallet: String,
    explorers: &'static [Explorer],
    // The Litecoin integration reports an empty deposit scan as a
    // "no transactions found" error; the Bitcoin one reports no match.
    // Callers tolerate both, but each chain keeps its own convention.
    empty_scan_is_error: bool,
}

impl NodeWallet {
    pub fn bitcoin_from_env() -> Result<NodeWallet, Error> {
        Ok(NodeWallet::new(
            &super::env_var("BTC_NODE_HOST")?,
            &super::env_var("BTC_RPC_USER")?,
            &super::env_var("BTC_RPC_PASS")?,
            &super::env_var("BTC_WALLET_NAME")?,
            BTC_EXPLORERS,
            false,
        ))
    }

    pub fn litecoin_from_env() -> Result<NodeWallet, Error> {
        Ok(NodeWallet::new(
            &super::env_var("LTC_NODE_HOST")?,
            &super::env_var("LTC_RPC_USER")?,
            &super::env_var("LTC_RPC_PASS")?,
            &super::env_var("LTC_WALLET_NAME")?,
            LTC_EXPLORERS,
            true,
        ))
    }

    pub fn new(
        host: &str,
        user: &str,
        pass: &str,
        wallet: &str,
        explorers: &'static [Explorer],
        empty_scan_is_error: bool,
    ) -> NodeWallet {
        NodeWallet {
            host: host.trim_end_matches('/').to_owned(),
            auth: RpcAuth::Basic {
                username: user.to_owned(),
                password: pass.to_owned(),
            },
            wallet: wallet.to_owned(),
            explorers,
            empty_scan_is_error,
        }
    }

    fn node_call(
        &self,
        method: &str,
        params: Value,
    ) -> Box<dyn Future<Item = Value, Error = Error>> {
        let url = format!("http://{}", self.host);
        rpc_call(&url, &self.auth, rpc_body(method, params))
    }

    fn wallet_call(
        &self,
        method: &str,
        params: Value,
    ) -> Box<dyn Future<Item = Value, Error = Error>> {
        let url = format!("http://{}/wallet/{}", self.host, self.wallet);
        rpc_call(&url, &self.auth, rpc_body(method, params))
    }
}

fn rpc_body(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "1.0",
        "id": "node-wallet",
        "method": method,
        "params": params,
    })
}

/// Picks the earliest post-marker receive for the address out of a
/// `listtransactions` result. The earliest (not the latest) match is the
/// contract: a second payment to the same session address is ignored.
fn earliest_receive(
    entries: &[Value],
    address: &str,
    since: i64,
    explorers: &'static [Explorer],
) -> Option<CryptoTransaction> {
    let mut relevant: Vec<(i64, CryptoTransaction)> = Vec::new();
    for entry in entries {
        let category = entry.get("category").and_then(Value::as_str).unwrap_or("");
        let tx_address = entry.get("address").and_then(Value::as_str).unwrap_or("");
        if category != "receive" || tx_address != address {
            continue;
        }
        let time = match entry.get("time").and_then(Value::as_i64) {
            Some(t) => t,
            None => continue,
        };
        if time < since {
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
            time,
            CryptoTransaction {
                txid,
                confirmations,
                amount,
                explorers,
            },
        ));
    }
    relevant.sort_by_key(|(time, _)| *time);
    relevant.into_iter().next().map(|(_, tx)| tx)
}

/// Applies the chain's empty-scan convention: one daemon integration
/// reports "nothing yet" as `None`, the other as a "no transactions found"
/// error.
fn scan_outcome(
    found: Option<CryptoTransaction>,
    empty_scan_is_error: bool,
    since: i64,
) -> Result<Option<CryptoTransaction>, Error> {
    match found {
        Some(tx) => Ok(Some(tx)),
        None if empty_scan_is_error => Err(Error::WalletAPIError(format!(
            "no transactions found for address after {}",
            since
        ))),
        None => Ok(None),
    }
}

impl CryptoHandler for NodeWallet {
    fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        let this = self.clone();
        Box::new(
            self.node_call("listwallets", json!([]))
                .and_then(move |result| {
                    let loaded = result
                        .as_array()
                        .map(|wallets| {
                            wallets
                                .iter()
                                .any(|w| w.as_str() == Some(this.wallet.as_str()))
                        })
                        .unwrap_or(false);
                    if loaded {
                        return future::Either::A(future::ok(()));
                    }
                    let create = this.clone();
                    let fut = this
                        .node_call("loadwallet", json!([this.wallet]))
                        .map(|_| ())
                        .or_else(move |e| {
                            let text = s!(e);
                            if text.contains("not found")
                                || text.contains("Wallet file verification failed")
                            {
                                // name, disable_private_keys, blank, passphrase, avoid_reuse
                                future::Either::A(
                                    create
                                        .node_call(
                                            "createwallet",
                                            json!([create.wallet, false, false, "", true]),
                                        )
                                        .map(|_| ())
                                        .map_err(|e| {
                                            Error::WalletAPIError(format!(
                                                "failed to create wallet: {}",
                                                e
                                            ))
                                        }),
                                )
                            } else {
                                future::Either::B(future::err(e))
                            }
                        });
                    future::Either::B(fut)
                }),
        )
    }

    fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
        Box::new(
            self.wallet_call("getnewaddress", json!(["", "bech32"]))
                .and_then(|result| {
                    let address = result
                        .as_str()
                        .ok_or_else(|| {
                            Error::WalletAPIError(s!("unexpected response format from getnewaddress"))
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
            self.wallet_call("getbalance", json!(["*", 1]))
                .and_then(|result| {
                    result.as_f64().ok_or_else(|| {
                        Error::WalletAPIError(s!("unexpected response format from getbalance"))
                    })
                }),
        )
    }

    fn get_address_transaction(
        &self,
        address: &CryptoAddress,
    ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
        let address = address.clone();
        let explorers = self.explorers;
        let empty_scan_is_error = self.empty_scan_is_error;
        Box::new(
            self.wallet_call("listtransactions", json!(["*", 1000000, 0, true]))
                .and_then(move |result| {
                    let entries = result.as_array().ok_or_else(|| {
                        Error::WalletAPIError(s!(
                            "unexpected response format from listtransactions"
                        ))
                    })?;
                    let found = earliest_receive(
                        entries,
                        &address.address,
                        address.start_marker,
                        explorers,
                    );
                    scan_outcome(found, empty_scan_is_error, address.start_marker)
                }),
        )
    }

    fn get_transaction_details(
        &self,
        txid: &str,
    ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
        let txid = txid.to_owned();
        let explorers = self.explorers;
        Box::new(
            self.wallet_call("gettransaction", json!([txid.clone()]))
                .map_err(|e| Error::WalletAPIError(format!("failed to retrieve transaction: {}", e)))
                .and_then(move |result| {
                    if !result.is_object() {
                        return Err(Error::WalletAPIError(s!(
                            "invalid transaction response format"
                        )));
                    }
                    let confirmations = result
                        .get("confirmations")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let amount = result.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
                    Ok(CryptoTransaction {
                        txid,
                        confirmations,
                        amount,
                        explorers,
                    })
                }),
        )
    }

    fn send(
        &self,
        address: &CryptoAddress,
        amount: f64,
    ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
        let this = self.clone();
        let address = address.address.clone();
        Box::new(self.check_balance().and_then(move |balance| {
            if balance < amount {
                return future::Either::A(future::err(Error::WalletAPIError(format!(
                    "insufficient funds: available {:.8}, required {:.8}",
                    balance, amount
                ))));
            }
            // address, amount, comment, comment_to, subtractfeefromamount,
            // replaceable, conf_target, estimate_mode
            let fut = this
                .wallet_call(
                    "sendtoaddress",
                    json!([
                        address,
                        round_to_digits(amount, 8),
                        "",
                        "",
                        true,
                        false,
                        1,
                        "CONSERVATIVE",
                    ]),
                )
                .and_then(|result| {
                    let txid = result
                        .as_str()
                        .ok_or_else(|| {
                            Error::WalletAPIError(s!("invalid transaction response format"))
                        })?
                        .to_owned();
                    Ok(vec![txid])
                });
            future::Either::B(fut)
        }))
    }
}
