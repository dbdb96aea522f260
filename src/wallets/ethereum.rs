//! Account-model backend: JSON-RPC execution node plus a local keystore.
//! Every deposit address is a fresh keystore account; deposits are found by
//! walking blocks from the address's start height. Spends are signed
//! locally (EIP-155) and may fan out over several accounts.

use crate::blocking;
use crate::clients::{rpc_call, RpcAuth};
use crate::errors::Error;
use crate::ser::{from_hex, hex_to_u128, to_hex, u128_to_hex};
use crate::wallets::keystore::Keystore;
use crate::wallets::{keccak256, CryptoAddress, CryptoHandler, CryptoTransaction, Explorer};
use futures::future::{self, Future};
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use rlp::RlpStream;
use secp256k1::{Message, Secp256k1, SecretKey};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const ETH_EXPLORERS: &[Explorer] = &[Explorer {
    name: "etherscan",
    icon_path: "/styles/etherscan.png",
    url_prefix: "https://etherscan.io/tx/",
}];

const WEI: f64 = 1e18;
const GAS_LIMIT: u128 = 21000;

#[derive(Clone)]
pub struct EthereumWallet {
    node_url: String,
    keystore: Arc<Keystore>,
    chain_id: u64,
    // Last fully scanned block per watched address, so polls resume instead
    // of rescanning from the start marker. Dropped on the first hit.
    scan_cache: Arc<Mutex<HashMap<String, u64>>>,
}

impl EthereumWallet {
    pub fn from_env() -> Result<EthereumWallet, Error> {
        let chain_id = std::env::var("ETH_CHAIN_ID")
            .unwrap_or_else(|_| s!("1"))
            .parse::<u64>()
            .map_err(|e| Error::General(format!("bad ETH_CHAIN_ID: {}", e)))?;
        Ok(EthereumWallet::new(
            &super::env_var("ETH_NODE_URL")?,
            &super::env_var("ETH_KEYSTORE_DIR")?,
            &super::env_var("ETH_KEYSTORE_PASS")?,
            chain_id,
        ))
    }

    pub fn new(node_url: &str, keystore_dir: &str, passphrase: &str, chain_id: u64) -> EthereumWallet {
        EthereumWallet {
            node_url: node_url.trim_end_matches('/').to_owned(),
            keystore: Arc::new(Keystore::new(keystore_dir, passphrase)),
            chain_id,
            scan_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn rpc(&self, method: &str, params: Value) -> Box<dyn Future<Item = Value, Error = Error>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        rpc_call(&self.node_url, &RpcAuth::None, body)
    }

    fn quantity(
        &self,
        method: &'static str,
        params: Value,
    ) -> Box<dyn Future<Item = u128, Error = Error>> {
        Box::new(self.rpc(method, params).and_then(move |result| {
            let hex = result
                .as_str()
                .ok_or_else(|| Error::NodeAPIError(format!("{}: expected hex quantity", method)))?;
            hex_to_u128(hex)
        }))
    }

    fn block_number(&self) -> Box<dyn Future<Item = u64, Error = Error>> {
        Box::new(
            self.quantity("eth_blockNumber", json!([]))
                .map(|n| n as u64),
        )
    }

    fn gas_price(&self) -> Box<dyn Future<Item = u128, Error = Error>> {
        self.quantity("eth_gasPrice", json!([]))
    }

    fn balance(&self, address: &str) -> Box<dyn Future<Item = u128, Error = Error>> {
        self.quantity("eth_getBalance", json!([address, "latest"]))
    }

    fn pending_nonce(&self, address: &str) -> Box<dyn Future<Item = u128, Error = Error>> {
        self.quantity("eth_getTransactionCount", json!([address, "pending"]))
    }

    fn block_by_number(&self, number: u64) -> Box<dyn Future<Item = Value, Error = Error>> {
        self.rpc(
            "eth_getBlockByNumber",
            json!([u128_to_hex(number as u128), true]),
        )
    }

    fn send_raw(&self, raw: String) -> Box<dyn Future<Item = String, Error = Error>> {
        Box::new(
            self.rpc("eth_sendRawTransaction", json!([raw]))
                .and_then(|result| {
                    result
                        .as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| Error::NodeAPIError(s!("eth_sendRawTransaction: no hash")))
                }),
        )
    }

    fn list_accounts(&self) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
        let keystore = self.keystore.clone();
        Box::new(blocking::run(move || keystore.accounts()).from_err())
    }

    /// Balances of all keystore accounts; accounts whose balance call fails
    /// are left out of spend planning rather than aborting it.
    fn spendable_balances(&self) -> Box<dyn Future<Item = Vec<(String, u128)>, Error = Error>> {
        let this = self.clone();
        Box::new(self.list_accounts().and_then(move |accounts| {
            let lookups: Vec<_> = accounts
                .into_iter()
                .map(|address| {
                    let fut = this.balance(&address);
                    fut.then(move |res| Ok::<_, Error>(res.ok().map(|wei| (address, wei))))
                })
                .collect();
            future::join_all(lookups)
                .map(|entries| entries.into_iter().filter_map(|entry| entry).collect())
        }))
    }

    /// Unlocks the account, signs a transfer of `amount_wei` minus the
    /// network fee, re-locks, then broadcasts. The key is held in memory
    /// only between unlock and the lock right after signing.
    fn send_from_account(
        &self,
        account: String,
        to: [u8; 20],
        amount_wei: u128,
        gas_price: u128,
    ) -> Box<dyn Future<Item = String, Error = Error>> {
        let this = self.clone();
        let keystore = self.keystore.clone();
        let unlock_keystore = self.keystore.clone();
        let lock_keystore = self.keystore.clone();
        let nonce_account = account.clone();
        let lock_account = account.clone();
        let chain_id = self.chain_id;
        Box::new(
            blocking::run({
                let account = account.clone();
                move || unlock_keystore.unlock(&account)
            })
            .from_err()
            .and_then(move |_| this.pending_nonce(&nonce_account))
            .and_then(move |nonce| {
                let secret = keystore.secret(&account)?;
                let fee = gas_price * GAS_LIMIT;
                let value = amount_wei
                    .checked_sub(fee)
                    .ok_or(Error::NotEnoughFunds)?;
                let tx = UnsignedTx {
                    nonce,
                    gas_price,
                    gas_limit: GAS_LIMIT,
                    to,
                    value,
                };
                sign_transaction(&tx, chain_id, &secret)
            })
            .then(move |signed| {
                lock_keystore.lock(&lock_account);
                signed
            })
            .and_then({
                let this = self.clone();
                move |raw| this.send_raw(raw)
            }),
        )
    }
}

struct UnsignedTx {
    nonce: u128,
    gas_price: u128,
    gas_limit: u128,
    to: [u8; 20],
    value: u128,
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn be_bytes(value: u128) -> Vec<u8> {
    trim_leading_zeros(&value.to_be_bytes())
}

fn encode_tx(tx: &UnsignedTx, chain_id: u64, signature: Option<(u64, &[u8], &[u8])>) -> Vec<u8> {
    let mut stream = RlpStream::new_list(9);
    stream.append(&be_bytes(tx.nonce));
    stream.append(&be_bytes(tx.gas_price));
    stream.append(&be_bytes(tx.gas_limit));
    stream.append(&tx.to.to_vec());
    stream.append(&be_bytes(tx.value));
    stream.append(&Vec::<u8>::new());
    match signature {
        // EIP-155 pre-image: (chain_id, 0, 0) in the signature slots.
        None => {
            stream.append(&be_bytes(chain_id as u128));
            stream.append(&Vec::<u8>::new());
            stream.append(&Vec::<u8>::new());
        }
        Some((v, r, s)) => {
            stream.append(&be_bytes(v as u128));
            stream.append(&trim_leading_zeros(r));
            stream.append(&trim_leading_zeros(s));
        }
    }
    stream.out()
}

fn sign_transaction(tx: &UnsignedTx, chain_id: u64, secret: &SecretKey) -> Result<String, Error> {
    let preimage = encode_tx(tx, chain_id, None);
    let hash = keccak256(&preimage);
    let secp = Secp256k1::new();
    let message =
        Message::from_slice(&hash).map_err(|e| Error::General(format!("bad sign hash: {}", e)))?;
    let signature = secp.sign_recoverable(&message, secret);
    let (recovery_id, data) = signature.serialize_compact();
    let v = chain_id * 2 + 35 + recovery_id.to_i32() as u64;
    let raw = encode_tx(tx, chain_id, Some((v, &data[..32], &data[32..])));
    Ok(format!("0x{}", to_hex(&raw)))
}

fn parse_address(address: &str) -> Result<[u8; 20], Error> {
    let bytes = from_hex(address).map_err(|_| Error::Validation(s!("invalid recipient address")))?;
    if bytes.len() != 20 {
        return Err(Error::Validation(s!("invalid recipient address")));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Which accounts pay which part of a spend. A single sufficient account
/// takes the whole amount; otherwise accounts are drained in order until
/// the amount is covered.
fn plan_spend(
    balances: &[(String, u128)],
    amount: u128,
    fee: u128,
) -> Result<Vec<(String, u128)>, Error> {
    if let Some((account, _)) = balances.iter().find(|(_, wei)| *wei >= amount) {
        return Ok(vec![(account.clone(), amount)]);
    }
    let total: u128 = balances.iter().map(|(_, wei)| wei).sum();
    if total < amount.saturating_sub(fee) {
        return Err(Error::NotEnoughFunds);
    }
    let mut remaining = amount;
    let mut plan = Vec::new();
    for (account, wei) in balances {
        if remaining == 0 {
            break;
        }
        if *wei == 0 {
            continue;
        }
        let part = (*wei).min(remaining);
        plan.push((account.clone(), part));
        remaining -= part;
    }
    if plan.is_empty() {
        return Err(Error::General(s!("no transactions were sent")));
    }
    Ok(plan)
}

struct Sweep {
    from: String,
    to: [u8; 20],
    amount: u128,
}

/// Dust accounts (more than one fee, less than ten) are swept into a
/// randomly chosen well-funded account.
fn consolidation_plan<R: Rng>(balances: &[(String, u128)], fee: u128, rng: &mut R) -> Vec<Sweep> {
    let ten_fees = 10 * fee;
    let large: Vec<&String> = balances
        .iter()
        .filter(|(_, wei)| *wei >= ten_fees)
        .map(|(account, _)| account)
        .collect();
    if large.is_empty() {
        return Vec::new();
    }
    let mut plan = Vec::new();
    for (account, wei) in balances {
        if *wei >= ten_fees || *wei <= fee {
            continue;
        }
        let target = large[rng.gen_range(0, large.len())];
        if let Ok(to) = parse_address(target) {
            plan.push(Sweep {
                from: account.clone(),
                to,
                amount: wei - fee,
            });
        }
    }
    plan
}

fn tx_chain_id(tx: &Value) -> Option<u64> {
    if let Some(id) = tx.get("chainId").and_then(Value::as_str) {
        return hex_to_u128(id).ok().map(|v| v as u64);
    }
    let v = tx.get("v").and_then(Value::as_str).and_then(|s| hex_to_u128(s).ok())? as u64;
    if v >= 35 {
        Some((v - 35) / 2)
    } else {
        // Pre-EIP-155 signature, no replay protection: not ours.
        None
    }
}

fn find_match_in_block(
    block: &Value,
    address_lc: &str,
    chain_id: u64,
    tip: u64,
) -> Option<CryptoTransaction> {
    let number = block
        .get("number")
        .and_then(Value::as_str)
        .and_then(|s| hex_to_u128(s).ok())? as u64;
    let transactions = block.get("transactions")?.as_array()?;
    for tx in transactions {
        if tx_chain_id(tx) != Some(chain_id) {
            continue;
        }
        let from = tx
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        let to = tx
            .get("to")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        if from != address_lc && to != address_lc {
            continue;
        }
        let value = tx
            .get("value")
            .and_then(Value::as_str)
            .and_then(|s| hex_to_u128(s).ok())
            .unwrap_or(0);
        let txid = tx
            .get("hash")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        return Some(CryptoTransaction {
            txid,
            confirmations: tip.saturating_sub(number) as i64,
            amount: value as f64 / WEI,
            explorers: ETH_EXPLORERS,
        });
    }
    None
}

impl CryptoHandler for EthereumWallet {
    fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        Box::new(self.block_number().map(|_| ()))
    }

    fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
        let this = self.clone();
        let keystore = self.keystore.clone();
        Box::new(
            blocking::run(move || keystore.new_account())
                .from_err()
                .and_then(move |address| {
                    this.block_number().map(move |tip| CryptoAddress {
                        address,
                        start_marker: tip as i64,
                    })
                }),
        )
    }

    fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>> {
        let this = self.clone();
        Box::new(
            self.list_accounts()
                .and_then(move |accounts| {
                    let lookups: Vec<_> =
                        accounts.into_iter().map(|a| this.balance(&a)).collect();
                    future::join_all(lookups)
                })
                .map(|balances: Vec<u128>| balances.into_iter().map(|wei| wei as f64 / WEI).sum()),
        )
    }

    fn get_address_transaction(
        &self,
        address: &CryptoAddress,
    ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
        let this = self.clone();
        let watched = address.address.clone();
        let start_marker = address.start_marker.max(0) as u64;
        Box::new(self.block_number().and_then(move |tip| {
            let start = match this.scan_cache.lock().get(&watched) {
                Some(scanned) => scanned + 1,
                None => start_marker,
            };
            let address_lc = watched.to_lowercase();
            let chain_id = this.chain_id;
            let fetcher = this.clone();
            let cache = this.scan_cache.clone();
            stream::iter_ok::<_, Error>(start..=tip)
                .and_then(move |number| fetcher.block_by_number(number))
                .filter_map(move |block| find_match_in_block(&block, &address_lc, chain_id, tip))
                .into_future()
                .map_err(|(e, _)| e)
                .map(move |(found, _)| {
                    let mut cache = cache.lock();
                    match found {
                        Some(tx) => {
                            cache.remove(&watched);
                            Some(tx)
                        }
                        None => {
                            cache.insert(watched, tip);
                            None
                        }
                    }
                })
        }))
    }

    fn get_transaction_details(
        &self,
        txid: &str,
    ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
        let txid = txid.to_owned();
        let result_txid = txid.clone();
        Box::new(
            self.rpc("eth_getTransactionByHash", json!([txid.clone()]))
                .join3(
                    self.rpc("eth_getTransactionReceipt", json!([txid])),
                    self.block_number(),
                )
                .and_then(move |(tx, receipt, tip)| {
                    if tx.is_null() {
                        return Err(Error::NodeAPIError(s!("transaction not found")));
                    }
                    if receipt.is_null() {
                        return Err(Error::NodeAPIError(s!("transaction receipt not found")));
                    }
                    let value = tx
                        .get("value")
                        .and_then(Value::as_str)
                        .and_then(|s| hex_to_u128(s).ok())
                        .unwrap_or(0);
                    let confirmations = receipt
                        .get("blockNumber")
                        .and_then(Value::as_str)
                        .and_then(|s| hex_to_u128(s).ok())
                        .map(|number| tip.saturating_sub(number as u64) as i64)
                        .unwrap_or(0);
                    Ok(CryptoTransaction {
                        txid: result_txid,
                        confirmations,
                        amount: value as f64 / WEI,
                        explorers: ETH_EXPLORERS,
                    })
                }),
        )
    }

    fn send(
        &self,
        address: &CryptoAddress,
        amount: f64,
    ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
        let to = match parse_address(&address.address) {
            Ok(to) => to,
            Err(e) => return Box::new(future::err(e)),
        };
        let amount_wei = (amount * WEI).round() as u128;
        let this = self.clone();
        Box::new(
            self.gas_price()
                .join(self.spendable_balances())
                .and_then(move |(gas_price, balances)| {
                    let fee = gas_price * GAS_LIMIT;
                    let plan = match plan_spend(&balances, amount_wei, fee) {
                        Ok(plan) => plan,
                        Err(e) => return future::Either::A(future::err(e)),
                    };
                    future::Either::B(
                        stream::iter_ok(plan)
                            .and_then(move |(account, part)| {
                                this.send_from_account(account, to, part, gas_price)
                            })
                            .collect(),
                    )
                }),
        )
    }

    fn consolidate(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        let this = self.clone();
        Box::new(
            self.gas_price()
                .join(self.spendable_balances())
                .and_then(move |(gas_price, balances)| {
                    let fee = gas_price * GAS_LIMIT;
                    let plan = consolidation_plan(&balances, fee, &mut thread_rng());
                    stream::iter_ok::<_, Error>(plan).for_each(move |sweep| {
                        this.send_from_account(sweep.from, sweep.to, sweep.amount, gas_price)
                            .map(|_| ())
                            .or_else(|_| Ok(()))
                    })
                }),
        )
    }
}
