//! Exchange sessions and the state machine that drives them.
//!
//! A session moves CREATED -> AWAITING INPUT -> CONFIRMING INPUT ->
//! EXCHANGING -> CONFIRMING OUTPUT -> SUCCESS, or into TRANSLATION FAILED
//! from anywhere. Each session is owned by exactly one [`Driver`] actor;
//! everything else takes brief locked snapshots through the registry.

use crate::config::Config;
use crate::crypt::encrypt_internal_message;
use crate::errors::Error;
use crate::store::{convert, convert_without_fee, PriceStore};
use crate::wallets::{CryptoAddress, CryptoTransaction, HandlerRef};
use actix::prelude::*;
use chrono::Utc;
use futures::future::{self, Future};
use parking_lot::RwLock;
use rand::{thread_rng, Rng};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};

pub const SESSION_TTL_SECONDS: i64 = 15 * 60;
pub const COLLECTION_DELAY_SECONDS: i64 = 60 * 60;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const OUTPUT_FETCH_ATTEMPTS: u32 = 3;

/// Session lifecycle states, ordered by progress. The wire spellings are
/// what the order page and the logs show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
pub enum Status {
    #[strum(serialize = "CREATED")]
    Created,
    #[strum(serialize = "AWAITING INPUT")]
    AwaitingInput,
    #[strum(serialize = "CONFIRMING INPUT")]
    ConfirmingInput,
    #[strum(serialize = "EXCHANGING")]
    Exchanging,
    #[strum(serialize = "CONFIRMING OUTPUT")]
    ConfirmingOutput,
    #[strum(serialize = "SUCCESS")]
    Success,
    #[strum(serialize = "TRANSLATION FAILED")]
    TranslationFailed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::TranslationFailed)
    }
}

#[derive(Clone)]
pub struct ExchangeSession {
    pub order_id: String,
    pub status: Status,
    pub from_handler: HandlerRef,
    pub to_handler: HandlerRef,
    pub from_id: i64,
    pub to_id: i64,
    pub from_sign: String,
    pub to_sign: String,
    pub fee_rate_percent: f64,
    /// Amount of the FROM asset the user pays. Authoritative from the
    /// moment a deposit is observed.
    pub send_amount: f64,
    /// Amount of the TO asset the user receives. Display-only estimate
    /// until the deposit lands.
    pub receive_amount: f64,
    pub to_address: String,
    pub refund_address: String,
    pub from_address: String,
    pub from_transaction: CryptoTransaction,
    pub to_transactions: Vec<CryptoTransaction>,
    pub to_conf: i64,
    pub from_conf: i64,
    pub exchange_rate: f64,
    pub error_message: String,
    pub expiration_time: i64,
    /// UNIX seconds after which the reaper may drop the session; -1 means
    /// "keep".
    pub collection_time: i64,
}

impl std::fmt::Debug for ExchangeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSession")
            .field("order_id", &self.order_id)
            .field("status", &self.status)
            .field("from_id", &self.from_id)
            .field("to_id", &self.to_id)
            .field("from_sign", &self.from_sign)
            .field("to_sign", &self.to_sign)
            .field("fee_rate_percent", &self.fee_rate_percent)
            .field("send_amount", &self.send_amount)
            .field("receive_amount", &self.receive_amount)
            .field("to_address", &self.to_address)
            .field("refund_address", &self.refund_address)
            .field("from_address", &self.from_address)
            .field("from_transaction", &self.from_transaction)
            .field("to_transactions", &self.to_transactions)
            .field("to_conf", &self.to_conf)
            .field("from_conf", &self.from_conf)
            .field("exchange_rate", &self.exchange_rate)
            .field("error_message", &self.error_message)
            .field("expiration_time", &self.expiration_time)
            .field("collection_time", &self.collection_time)
            .finish()
    }
}

pub type SessionRegistry = Arc<RwLock<HashMap<String, ExchangeSession>>>;

pub fn new_registry() -> SessionRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

fn generate_order_id() -> String {
    let mut buffer = [0u8; 8];
    thread_rng().fill(&mut buffer);
    crate::ser::to_hex(&buffer)
}

/// Everything session creation and the drivers need; cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    pub sessions: SessionRegistry,
    pub store: Arc<PriceStore>,
    pub handlers: Arc<HashMap<i64, HandlerRef>>,
    pub config: Arc<Config>,
    pub maintenance: Arc<AtomicBool>,
}

impl Exchange {
    /// Validates the request and registers a new session. The caller is
    /// responsible for spawning the [`Driver`] afterwards.
    pub fn create_session(
        &self,
        from_id: i64,
        to_id: i64,
        from_amount: f64,
        to_address: String,
        refund_address: String,
    ) -> Box<dyn Future<Item = ExchangeSession, Error = Error>> {
        if self.maintenance.load(Ordering::SeqCst) {
            return Box::new(future::err(Error::Maintenance));
        }
        let from_handler = match self.handlers.get(&from_id) {
            Some(handler) => handler.clone(),
            None => return Box::new(future::err(Error::Validation(s!("invalid crypto (from)")))),
        };
        let to_handler = match self.handlers.get(&to_id) {
            Some(handler) => handler.clone(),
            None => return Box::new(future::err(Error::Validation(s!("invalid crypto (to)")))),
        };
        let (from_asset, to_asset) = match (self.config.asset(from_id), self.config.asset(to_id)) {
            (Some(from_asset), Some(to_asset)) => (from_asset.clone(), to_asset.clone()),
            _ => return Box::new(future::err(Error::Validation(s!("invalid crypto sign")))),
        };
        let checks = (|| {
            let to_regex = Regex::new(&to_asset.address_regex)
                .map_err(|e| Error::General(format!("bad address regex: {}", e)))?;
            if !to_regex.is_match(&to_address) {
                return Err(Error::Validation(s!("invalid address")));
            }
            // The refund goes back on the FROM chain.
            let from_regex = Regex::new(&from_asset.address_regex)
                .map_err(|e| Error::General(format!("bad address regex: {}", e)))?;
            if !from_regex.is_match(&refund_address) {
                return Err(Error::Validation(s!("invalid address")));
            }
            let fee = self
                .store
                .get_fee(from_id, to_id)
                .ok_or_else(|| Error::Validation(s!("route unavailable")))?;
            let min_amount = self
                .store
                .get_min_amount(from_id, to_id)
                .ok_or_else(|| Error::Validation(s!("route unavailable")))?;
            if from_amount < min_amount {
                return Err(Error::Validation(format!(
                    "minimum amount {:.6} {}",
                    from_amount, from_asset.asset_sign
                )));
            }
            let exchange_rate = convert_without_fee(&self.store, from_id, to_id, 1.0)
                .map_err(|_| Error::Validation(s!("unable to calculate exchange rate")))?;
            let receive_amount = convert(&self.store, from_id, to_id, from_amount)
                .map_err(|_| Error::Validation(s!("unable to calculate to amount")))?;
            Ok((fee, exchange_rate, receive_amount))
        })();
        let (fee, exchange_rate, receive_amount) = match checks {
            Ok(values) => values,
            Err(e) => return Box::new(future::err(e)),
        };

        let sessions = self.sessions.clone();
        let balance_check = to_handler.check_balance();
        Box::new(
            balance_check
                .map_err(|_| Error::Validation(s!("unable to calculate balance")))
                .and_then(move |balance| {
                    if receive_amount > balance {
                        return Err(Error::Validation(s!(
                            "asking amount is higher than resources in the reserve"
                        )));
                    }
                    let mut sessions = sessions.write();
                    let order_id = loop {
                        let candidate = generate_order_id();
                        if !sessions.contains_key(&candidate) {
                            break candidate;
                        }
                    };
                    let session = ExchangeSession {
                        order_id: order_id.clone(),
                        status: Status::Created,
                        from_handler,
                        to_handler,
                        from_id,
                        to_id,
                        from_sign: from_asset.asset_sign.clone(),
                        to_sign: to_asset.asset_sign.clone(),
                        fee_rate_percent: fee * 100.0,
                        send_amount: from_amount,
                        receive_amount,
                        to_address,
                        refund_address,
                        from_address: String::new(),
                        from_transaction: CryptoTransaction::blank(),
                        to_transactions: vec![CryptoTransaction::blank()],
                        to_conf: to_asset.confirmations_needed,
                        from_conf: from_asset.confirmations_needed,
                        exchange_rate,
                        error_message: String::new(),
                        expiration_time: Utc::now().timestamp() + SESSION_TTL_SECONDS,
                        collection_time: -1,
                    };
                    sessions.insert(order_id, session.clone());
                    Ok(session)
                }),
        )
    }
}

enum FailureKind {
    AddressGeneration,
    Expired,
    CalculateAmount,
    Exchange,
    OutputDetails,
}

/// The one task that owns a session's lifecycle. All session writes go
/// through this actor; polling steps run strictly one at a time.
pub struct Driver {
    exchange: Exchange,
    order_id: String,
    poll_interval: Duration,
    deposit_address: Option<CryptoAddress>,
    output_txids: Vec<String>,
    output_attempts: u32,
}

impl Driver {
    pub fn spawn(exchange: Exchange, order_id: String) -> Addr<Driver> {
        Driver::spawn_with_interval(exchange, order_id, POLL_INTERVAL)
    }

    pub fn spawn_with_interval(
        exchange: Exchange,
        order_id: String,
        poll_interval: Duration,
    ) -> Addr<Driver> {
        Driver {
            exchange,
            order_id,
            poll_interval,
            deposit_address: None,
            output_txids: Vec::new(),
            output_attempts: 0,
        }
        .start()
    }

    fn with_session<T>(&self, f: impl FnOnce(&ExchangeSession) -> T) -> Option<T> {
        self.exchange.sessions.read().get(&self.order_id).map(f)
    }

    fn update_session(&self, f: impl FnOnce(&mut ExchangeSession)) {
        if let Some(session) = self.exchange.sessions.write().get_mut(&self.order_id) {
            f(session);
        }
    }

    /// Runs the future to completion before anything else happens to this
    /// actor, then hands the result back to `handle`.
    fn wait_for<T, F, H>(&mut self, ctx: &mut Context<Self>, fut: F, handle: H)
    where
        T: 'static,
        F: Future<Item = T, Error = Error> + 'static,
        H: FnOnce(&mut Driver, Result<T, Error>, &mut Context<Driver>) + 'static,
    {
        let task = actix::fut::wrap_future::<_, Driver>(fut.then(|res| Ok::<_, ()>(res)))
            .map(|res, act, ctx| handle(act, res, ctx));
        ctx.wait(task);
    }

    fn schedule_step(&mut self, ctx: &mut Context<Self>) {
        ctx.run_later(self.poll_interval, |act, ctx| act.step(ctx));
    }

    fn step(&mut self, ctx: &mut Context<Self>) {
        let status = match self.with_session(|s| s.status) {
            Some(status) => status,
            // Reaped or cleared by the operator; nothing left to drive.
            None => {
                ctx.stop();
                return;
            }
        };
        match status {
            Status::Created => self.allocate_address(ctx),
            Status::AwaitingInput => self.poll_deposit(ctx),
            Status::ConfirmingInput => self.poll_input_confirmations(ctx),
            Status::Exchanging | Status::ConfirmingOutput => self.refresh_outputs(ctx),
            Status::Success | Status::TranslationFailed => ctx.stop(),
        }
    }

    fn allocate_address(&mut self, ctx: &mut Context<Self>) {
        let fut = match self.with_session(|s| s.from_handler.clone()) {
            Some(handler) => handler.generate_new_address(),
            None => {
                ctx.stop();
                return;
            }
        };
        self.wait_for(ctx, fut, |act, res, ctx| match res {
            Ok(address) => {
                log_activity!(
                    "Address successfully created {} awaiting input, order {}",
                    address.address,
                    act.order_id
                );
                act.update_session(|s| {
                    s.from_address = address.address.clone();
                    s.status = Status::AwaitingInput;
                });
                act.deposit_address = Some(address);
                act.step(ctx);
            }
            Err(e) => act.fail(FailureKind::AddressGeneration, e, ctx),
        });
    }

    fn poll_deposit(&mut self, ctx: &mut Context<Self>) {
        let (expiration_time, handler) =
            match self.with_session(|s| (s.expiration_time, s.from_handler.clone())) {
                Some(parts) => parts,
                None => {
                    ctx.stop();
                    return;
                }
            };
        // A payment arriving exactly at the expiration second still counts.
        if Utc::now().timestamp() > expiration_time {
            self.fail(
                FailureKind::Expired,
                Error::General(s!("transaction expired")),
                ctx,
            );
            return;
        }
        let address = match self.deposit_address.clone() {
            Some(address) => address,
            None => {
                ctx.stop();
                return;
            }
        };
        let fut = handler.get_address_transaction(&address);
        self.wait_for(ctx, fut, |act, res, ctx| match res {
            Ok(Some(tx)) => act.on_deposit(tx, ctx),
            Ok(None) => {
                act.refresh_display_amounts();
                act.schedule_step(ctx);
            }
            Err(e) => {
                // Both daemon conventions land here: a "no transactions
                // found" error and any transient RPC fault mean "keep
                // polling".
                if s!(e).contains("no transactions found") {
                    act.refresh_display_amounts();
                }
                act.schedule_step(ctx);
            }
        });
    }

    /// Pre-deposit estimate refresh. Writes receive_amount twice (the
    /// fee-adjusted conversion, then the raw per-unit rate); the field is a
    /// display value only until a deposit fixes the real amounts.
    fn refresh_display_amounts(&mut self) {
        let parts = self.with_session(|s| (s.from_id, s.to_id, s.send_amount));
        let (from_id, to_id, send_amount) = match parts {
            Some(parts) => parts,
            None => return,
        };
        if let Ok(receive_amount) = convert(&self.exchange.store, from_id, to_id, send_amount) {
            self.update_session(|s| s.receive_amount = receive_amount);
        }
        if let Ok(exchange_rate) = convert_without_fee(&self.exchange.store, from_id, to_id, 1.0) {
            self.update_session(|s| s.receive_amount = exchange_rate);
        }
    }

    fn on_deposit(&mut self, tx: CryptoTransaction, ctx: &mut Context<Self>) {
        let parts = self.with_session(|s| (s.from_id, s.to_id, s.from_sign.clone()));
        let (from_id, to_id, from_sign) = match parts {
            Some(parts) => parts,
            None => {
                ctx.stop();
                return;
            }
        };
        log_activity!(
            "Received {} {} at address {} confirming input, order {}",
            tx.amount,
            from_sign,
            self.deposit_address
                .as_ref()
                .map(|a| a.address.as_str())
                .unwrap_or(""),
            self.order_id
        );
        // From here the observed amount is authoritative; over- and
        // under-payments settle at whatever actually arrived.
        let observed_amount = tx.amount;
        self.update_session(|s| {
            s.status = Status::ConfirmingInput;
            s.from_transaction = tx;
            s.send_amount = observed_amount;
        });
        match convert(&self.exchange.store, from_id, to_id, observed_amount) {
            Ok(receive_amount) => {
                self.update_session(|s| s.receive_amount = receive_amount);
                self.step(ctx);
            }
            Err(e) => self.fail(FailureKind::CalculateAmount, e, ctx),
        }
    }

    fn poll_input_confirmations(&mut self, ctx: &mut Context<Self>) {
        let parts = self.with_session(|s| {
            (
                s.from_transaction.clone(),
                s.from_conf,
                s.from_handler.clone(),
            )
        });
        let (from_transaction, from_conf, handler) = match parts {
            Some(parts) => parts,
            None => {
                ctx.stop();
                return;
            }
        };
        if from_transaction.confirmations >= from_conf {
            self.start_exchange(ctx);
            return;
        }
        let fut = handler.get_transaction_details(&from_transaction.txid);
        self.wait_for(ctx, fut, |act, res, ctx| {
            if let Ok(tx) = res {
                act.update_session(|s| s.from_transaction = tx);
            }
            act.schedule_step(ctx);
        });
    }

    fn start_exchange(&mut self, ctx: &mut Context<Self>) {
        let parts = self.with_session(|s| {
            (
                s.from_transaction.txid.clone(),
                s.from_conf,
                s.to_handler.clone(),
                s.to_address.clone(),
                s.receive_amount,
            )
        });
        let (txid, from_conf, to_handler, to_address, receive_amount) = match parts {
            Some(parts) => parts,
            None => {
                ctx.stop();
                return;
            }
        };
        log_activity!(
            "Incoming transaction {} confirmed {} times, exchanging, order {}",
            txid,
            from_conf,
            self.order_id
        );
        self.update_session(|s| s.status = Status::Exchanging);
        let fut = to_handler.send(
            CryptoAddress {
                address: to_address,
                start_marker: 0,
            },
            receive_amount,
        );
        self.wait_for(ctx, fut, |act, res, ctx| match res {
            Ok(txids) => {
                log_activity!(
                    "Funds exchanged successfully output transactions {:?}, order {}",
                    txids,
                    act.order_id
                );
                act.output_txids = txids;
                act.output_attempts = 0;
                act.schedule_step(ctx);
            }
            Err(e) => act.fail(FailureKind::Exchange, e, ctx),
        });
    }

    /// Fetches every outbound txid. While EXCHANGING this resolves the
    /// dispatched transactions; in CONFIRMING OUTPUT it refreshes them until
    /// every one has enough confirmations. Three consecutive failed rounds
    /// are terminal.
    fn refresh_outputs(&mut self, ctx: &mut Context<Self>) {
        let parts = self.with_session(|s| (s.to_handler.clone(), s.to_conf, s.status));
        let (handler, to_conf, status) = match parts {
            Some(parts) => parts,
            None => {
                ctx.stop();
                return;
            }
        };
        if self.output_txids.is_empty() {
            // Nothing was dispatched; the send step never completed.
            self.fail(
                FailureKind::OutputDetails,
                Error::General(s!("no output transactions recorded")),
                ctx,
            );
            return;
        }
        let lookups: Vec<_> = self
            .output_txids
            .iter()
            .map(|txid| handler.get_transaction_details(txid))
            .collect();
        let fut = future::join_all(lookups);
        self.wait_for(ctx, fut, move |act, res, ctx| match res {
            Ok(transactions) => {
                act.output_attempts = 0;
                let all_confirmed = transactions.iter().all(|tx| tx.confirmations >= to_conf);
                act.update_session(|s| s.to_transactions = transactions);
                if status == Status::Exchanging {
                    act.update_session(|s| s.status = Status::ConfirmingOutput);
                    act.schedule_step(ctx);
                } else if all_confirmed {
                    act.succeed(ctx);
                } else {
                    act.schedule_step(ctx);
                }
            }
            Err(e) => {
                act.output_attempts += 1;
                if act.output_attempts >= OUTPUT_FETCH_ATTEMPTS {
                    act.fail(FailureKind::OutputDetails, e, ctx);
                } else {
                    act.schedule_step(ctx);
                }
            }
        });
    }

    fn succeed(&mut self, ctx: &mut Context<Self>) {
        log_activity!("Order completed successfully, order {}", self.order_id);
        self.update_session(|s| {
            s.status = Status::Success;
            s.collection_time = Utc::now().timestamp() + COLLECTION_DELAY_SECONDS;
        });
        ctx.stop();
    }

    fn fail(&mut self, kind: FailureKind, err: Error, ctx: &mut Context<Self>) {
        let message = match kind {
            FailureKind::AddressGeneration => format!(
                "Unable to generate new address.{}",
                encrypt_internal_message(&err)
            ),
            FailureKind::Expired => s!("Transaction Expired"),
            FailureKind::CalculateAmount => format!(
                "Unable to calculate amount to send.{}",
                encrypt_internal_message(&err)
            ),
            FailureKind::Exchange => {
                format!("Unable to exchange funds.{}", encrypt_internal_message(&err))
            }
            FailureKind::OutputDetails => format!(
                "Unable to fetch output transaction details.{}",
                encrypt_internal_message(&err)
            ),
        };
        match kind {
            FailureKind::Expired => log_error!("Order expired, order {}", self.order_id),
            _ => log_error!(
                "Order failed with error: {}, order {}",
                err,
                self.order_id
            ),
        }
        self.update_session(|s| {
            s.status = Status::TranslationFailed;
            s.error_message = message;
        });
        self.issue_refund_if_deposited();
        ctx.stop();
    }

    /// The refund gate: attempted exactly when a terminal failure happens
    /// after a deposit was recorded, and at most once. The refund runs on
    /// the arbiter so it survives this actor stopping; its outcome is only
    /// logged.
    fn issue_refund_if_deposited(&self) {
        let parts = self.with_session(|s| {
            (
                s.from_transaction.clone(),
                s.from_handler.clone(),
                s.refund_address.clone(),
            )
        });
        let (deposit, handler, refund_address) = match parts {
            Some(parts) => parts,
            None => return,
        };
        if deposit.is_blank() {
            return;
        }
        let order_id = self.order_id.clone();
        let refund = handler.send(
            CryptoAddress {
                address: refund_address,
                start_marker: 0,
            },
            deposit.amount,
        );
        actix::spawn(refund.then(move |res| {
            match res {
                Ok(txids) => {
                    log_activity!("Refund succeeded {:?}, order {}", txids, order_id)
                }
                Err(e) => log_error!("Refund failed with error: {}, order {}", e, order_id),
            }
            Ok(())
        }));
    }
}

impl Actor for Driver {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log_activity!("New Order Created, order {}", self.order_id);
        self.step(ctx);
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::wallets::CryptoHandler;

    /// Minimal wallet double for tests that only need a structurally valid
    /// session. Must be built inside a running `System`.
    pub struct NullWallet;

    impl CryptoHandler for NullWallet {
        fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
            Box::new(future::ok(()))
        }
        fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
            Box::new(future::err(Error::General(s!("null wallet"))))
        }
        fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>> {
            Box::new(future::ok(0.0))
        }
        fn get_address_transaction(
            &self,
            _address: &CryptoAddress,
        ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
            Box::new(future::ok(None))
        }
        fn get_transaction_details(
            &self,
            _txid: &str,
        ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
            Box::new(future::err(Error::General(s!("null wallet"))))
        }
        fn send(
            &self,
            _address: &CryptoAddress,
            _amount: f64,
        ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
            Box::new(future::err(Error::General(s!("null wallet"))))
        }
    }

    pub fn dummy_session(order_id: &str) -> ExchangeSession {
        let handler = HandlerRef::new(Arc::new(NullWallet));
        ExchangeSession {
            order_id: s!(order_id),
            status: Status::Created,
            from_handler: handler.clone(),
            to_handler: handler,
            from_id: 1,
            to_id: 2,
            from_sign: s!("BTC"),
            to_sign: s!("LTC"),
            fee_rate_percent: 1.0,
            send_amount: 0.01,
            receive_amount: 7.425,
            to_address: s!("ltc1qdest"),
            refund_address: s!("bc1qrefund"),
            from_address: String::new(),
            from_transaction: CryptoTransaction::blank(),
            to_transactions: vec![CryptoTransaction::blank()],
            to_conf: 3,
            from_conf: 1,
            exchange_rate: 750.0,
            error_message: String::new(),
            expiration_time: Utc::now().timestamp() + SESSION_TTL_SECONDS,
            collection_time: -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const TEST_INTERVAL: Duration = Duration::from_millis(5);

    /// Wallet double whose answers are scripted per call.
    #[derive(Default)]
    struct ScriptedWallet {
        new_address: Mutex<Option<CryptoAddress>>,
        addresses_generated: Mutex<usize>,
        balance: Mutex<f64>,
        deposits: Mutex<VecDeque<Result<Option<CryptoTransaction>, Error>>>,
        details: Mutex<VecDeque<CryptoTransaction>>,
        send_results: Mutex<VecDeque<Result<Vec<String>, Error>>>,
        sends_made: Mutex<Vec<(String, f64)>>,
    }

    impl ScriptedWallet {
        fn arc() -> Arc<ScriptedWallet> {
            Arc::new(ScriptedWallet::default())
        }
    }

    impl crate::wallets::CryptoHandler for ScriptedWallet {
        fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
            Box::new(future::ok(()))
        }

        fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
            *self.addresses_generated.lock() += 1;
            match self.new_address.lock().clone() {
                Some(address) => Box::new(future::ok(address)),
                None => Box::new(future::err(Error::WalletAPIError(s!("rpc down")))),
            }
        }

        fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>> {
            Box::new(future::ok(*self.balance.lock()))
        }

        fn get_address_transaction(
            &self,
            _address: &CryptoAddress,
        ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
            let next = self
                .deposits
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(None));
            Box::new(future::result(next))
        }

        fn get_transaction_details(
            &self,
            txid: &str,
        ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
            match self.details.lock().pop_front() {
                Some(tx) => Box::new(future::ok(tx)),
                None => Box::new(future::err(Error::WalletAPIError(format!(
                    "no details scripted for {}",
                    txid
                )))),
            }
        }

        fn send(
            &self,
            address: &CryptoAddress,
            amount: f64,
        ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
            self.sends_made
                .lock()
                .push((address.address.clone(), amount));
            let next = self
                .send_results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::WalletAPIError(s!("no send scripted"))));
            Box::new(future::result(next))
        }
    }

    fn tx(txid: &str, confirmations: i64, amount: f64) -> CryptoTransaction {
        CryptoTransaction {
            txid: s!(txid),
            confirmations,
            amount,
            explorers: &[],
        }
    }

    fn test_config() -> Config {
        serde_json::from_str(
            r#"{
              "supportedCryptos": [
                {"internalAssetID": 1, "coinmarketcapAssetID": 101, "assetName": "Bitcoin",
                 "addressRegex": "^bc1[a-z0-9]+$", "assetSign": "BTC", "precision": 8,
                 "confirmationsNeeded": 1},
                {"internalAssetID": 2, "coinmarketcapAssetID": 102, "assetName": "Litecoin",
                 "addressRegex": "^ltc1[a-z0-9]+$", "assetSign": "LTC", "precision": 8,
                 "confirmationsNeeded": 3}
              ],
              "routes": [
                {"pair": {"idFrom": 1, "idTo": 2}, "fee": 0.01, "minAmount": 0.001}
              ]
            }"#,
        )
        .unwrap()
    }

    /// Built inside a running System so the send gates can spawn.
    fn test_exchange(
        from_wallet: Arc<ScriptedWallet>,
        to_wallet: Arc<ScriptedWallet>,
    ) -> Exchange {
        let config = Arc::new(test_config());
        let store = Arc::new(PriceStore::new(&config));
        store.update(101, 60000.0);
        store.update(102, 80.0);
        let mut handlers = HashMap::new();
        handlers.insert(1, HandlerRef::new(from_wallet));
        handlers.insert(2, HandlerRef::new(to_wallet));
        Exchange {
            sessions: new_registry(),
            store,
            handlers: Arc::new(handlers),
            config,
            maintenance: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a session and hands the order id out through a slot; the
    /// caller runs the system.
    fn create_in_system(
        exchange: Exchange,
        from_amount: f64,
        to_address: &str,
        refund_address: &str,
        slot: Arc<Mutex<Option<Result<ExchangeSession, Error>>>>,
        stop_after: bool,
    ) {
        let fut = exchange.create_session(
            1,
            2,
            from_amount,
            s!(to_address),
            s!(refund_address),
        );
        actix::spawn(fut.then(move |res| {
            *slot.lock() = Some(res);
            if stop_after {
                System::current().stop();
            }
            Ok(())
        }));
    }

    /// Watches the registry and stops the system shortly after the session
    /// turns terminal (a few extra ticks let spawned refunds finish), or
    /// after a safety timeout.
    struct Probe {
        sessions: SessionRegistry,
        order_slot: Arc<Mutex<Option<String>>>,
        terminal_ticks: u32,
    }

    impl Actor for Probe {
        type Context = Context<Self>;

        fn started(&mut self, ctx: &mut Self::Context) {
            ctx.run_interval(Duration::from_millis(5), |act, _ctx| {
                if let Some(order_id) = act.order_slot.lock().clone() {
                    let done = act
                        .sessions
                        .read()
                        .get(&order_id)
                        .map(|s| s.status.is_terminal())
                        .unwrap_or(false);
                    if done {
                        act.terminal_ticks += 1;
                        if act.terminal_ticks >= 3 {
                            System::current().stop();
                        }
                    }
                }
            });
            ctx.run_later(Duration::from_secs(10), |_act, _ctx| {
                // Safety valve; assertions after run() will then fail loudly.
                System::current().stop();
            });
        }
    }

    fn run_scenario(
        from_wallet: Arc<ScriptedWallet>,
        to_wallet: Arc<ScriptedWallet>,
        from_amount: f64,
        backdate_expiration: bool,
    ) -> (Option<ExchangeSession>, Result<ExchangeSession, Error>) {
        let sys = System::new("fsm-test");
        let exchange = test_exchange(from_wallet, to_wallet);
        let sessions = exchange.sessions.clone();
        let created: Arc<Mutex<Option<Result<ExchangeSession, Error>>>> =
            Arc::new(Mutex::new(None));
        let order_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let created_in = created.clone();
        let order_in = order_slot.clone();
        let exchange_for_driver = exchange.clone();
        let sessions_for_backdate = sessions.clone();
        let fut = exchange.create_session(1, 2, from_amount, s!("ltc1qdest"), s!("bc1qrefund"));
        actix::spawn(fut.then(move |res| {
            match res {
                Ok(session) => {
                    let order_id = session.order_id.clone();
                    if backdate_expiration {
                        if let Some(stored) =
                            sessions_for_backdate.write().get_mut(&order_id)
                        {
                            stored.expiration_time = Utc::now().timestamp() - 1;
                        }
                    }
                    *order_in.lock() = Some(order_id.clone());
                    *created_in.lock() = Some(Ok(session));
                    Driver::spawn_with_interval(exchange_for_driver, order_id, TEST_INTERVAL);
                }
                Err(e) => {
                    *created_in.lock() = Some(Err(e));
                    System::current().stop();
                }
            }
            Ok(())
        }));
        Probe {
            sessions: sessions.clone(),
            order_slot: order_slot.clone(),
            terminal_ticks: 0,
        }
        .start();
        sys.run();

        let creation = created.lock().take().expect("creation resolved");
        let final_session = order_slot
            .lock()
            .clone()
            .and_then(|order_id| sessions.read().get(&order_id).cloned());
        (final_session, creation)
    }

    #[test]
    fn happy_path_reaches_success() {
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        *from_wallet.new_address.lock() = Some(CryptoAddress {
            address: s!("bc1qdeposit"),
            start_marker: 0,
        });
        // Two empty polls (one per empty-scan convention), then the deposit
        // shows up unconfirmed.
        {
            let mut deposits = from_wallet.deposits.lock();
            deposits.push_back(Ok(None));
            deposits.push_back(Err(Error::WalletAPIError(s!(
                "no transactions found for address after 0"
            ))));
            deposits.push_back(Ok(Some(tx("dep1", 0, 0.01))));
        }
        from_wallet.details.lock().push_back(tx("dep1", 1, 0.01));
        *to_wallet.balance.lock() = 100.0;
        to_wallet
            .send_results
            .lock()
            .push_back(Ok(vec![s!("out1")]));
        {
            let mut details = to_wallet.details.lock();
            details.push_back(tx("out1", 0, 7.425)); // resolve after dispatch
            details.push_back(tx("out1", 1, 7.425)); // still confirming
            details.push_back(tx("out1", 3, 7.425)); // done
        }

        let (final_session, creation) =
            run_scenario(from_wallet.clone(), to_wallet.clone(), 0.01, false);
        assert!(creation.is_ok());
        let session = final_session.expect("session still registered");
        assert_eq!(session.status, Status::Success);
        assert_eq!(session.send_amount, 0.01);
        assert!((session.receive_amount - 7.425).abs() < 1e-9);
        assert_eq!(session.from_address, "bc1qdeposit");
        assert_eq!(session.from_transaction.txid, "dep1");
        assert_eq!(session.to_transactions.len(), 1);
        assert_eq!(session.to_transactions[0].txid, "out1");
        assert!(session.collection_time > Utc::now().timestamp());
        // Exactly one outbound dispatch, for the converted amount.
        let sends = to_wallet.sends_made.lock();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "ltc1qdest");
        assert!((sends[0].1 - 7.425).abs() < 1e-9);
        // No refund on the happy path.
        assert!(from_wallet.sends_made.lock().is_empty());
    }

    #[test]
    fn expiration_without_deposit_fails_without_refund() {
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        *from_wallet.new_address.lock() = Some(CryptoAddress {
            address: s!("bc1qdeposit"),
            start_marker: 0,
        });
        *to_wallet.balance.lock() = 100.0;

        let (final_session, creation) =
            run_scenario(from_wallet.clone(), to_wallet.clone(), 0.01, true);
        assert!(creation.is_ok());
        let session = final_session.expect("session still registered");
        assert_eq!(session.status, Status::TranslationFailed);
        assert_eq!(session.error_message, "Transaction Expired");
        assert_eq!(session.collection_time, -1);
        assert!(from_wallet.sends_made.lock().is_empty());
        assert!(to_wallet.sends_made.lock().is_empty());
    }

    #[test]
    fn send_failure_triggers_single_refund() {
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        *from_wallet.new_address.lock() = Some(CryptoAddress {
            address: s!("bc1qdeposit"),
            start_marker: 0,
        });
        from_wallet
            .deposits
            .lock()
            .push_back(Ok(Some(tx("dep1", 1, 0.01))));
        // The refund send succeeds.
        from_wallet
            .send_results
            .lock()
            .push_back(Ok(vec![s!("refund1")]));
        *to_wallet.balance.lock() = 100.0;
        to_wallet
            .send_results
            .lock()
            .push_back(Err(Error::WalletAPIError(s!("daemon rejected spend"))));

        let (final_session, creation) =
            run_scenario(from_wallet.clone(), to_wallet.clone(), 0.01, false);
        assert!(creation.is_ok());
        let session = final_session.expect("session still registered");
        assert_eq!(session.status, Status::TranslationFailed);
        assert!(session
            .error_message
            .starts_with("Unable to exchange funds."));
        assert!(session.error_message.contains(" Internal Error: "));
        // Exactly one refund, to the refund address, for the observed
        // deposit amount.
        let refunds = from_wallet.sends_made.lock();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].0, "bc1qrefund");
        assert_eq!(refunds[0].1, 0.01);
        assert_eq!(session.collection_time, -1);
    }

    #[test]
    fn reserve_guard_rejects_creation() {
        let sys = System::new("fsm-reserve");
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        // Projected payout of 0.01 BTC -> 7.425 LTC exceeds a 1.0 reserve.
        *to_wallet.balance.lock() = 1.0;
        let exchange = test_exchange(from_wallet.clone(), to_wallet.clone());
        let sessions = exchange.sessions.clone();
        let slot: Arc<Mutex<Option<Result<ExchangeSession, Error>>>> = Arc::new(Mutex::new(None));
        create_in_system(exchange, 0.01, "ltc1qdest", "bc1qrefund", slot.clone(), true);
        sys.run();
        match slot.lock().take().expect("resolved") {
            Err(Error::Validation(message)) => {
                assert_eq!(message, "asking amount is higher than resources in the reserve")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(sessions.read().is_empty());
        assert_eq!(*from_wallet.addresses_generated.lock(), 0);
    }

    #[test]
    fn creation_validation_rejections() {
        let sys = System::new("fsm-validation");
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        *to_wallet.balance.lock() = 100.0;
        let exchange = test_exchange(from_wallet, to_wallet);
        let sessions = exchange.sessions.clone();

        let cases: Vec<(Box<dyn Future<Item = ExchangeSession, Error = Error>>, &str)> = vec![
            (
                exchange.create_session(9, 2, 0.01, s!("ltc1qdest"), s!("bc1qrefund")),
                "invalid crypto (from)",
            ),
            (
                exchange.create_session(1, 9, 0.01, s!("ltc1qdest"), s!("bc1qrefund")),
                "invalid crypto (to)",
            ),
            (
                exchange.create_session(1, 2, 0.01, s!("DEST"), s!("bc1qrefund")),
                "invalid address",
            ),
            (
                exchange.create_session(1, 2, 0.01, s!("ltc1qdest"), s!("REFUND")),
                "invalid address",
            ),
            (
                // Route (2 -> 1) is not configured.
                exchange.create_session(2, 1, 0.01, s!("bc1qdest"), s!("ltc1qrefund")),
                "route unavailable",
            ),
            (
                exchange.create_session(1, 2, 0.0005, s!("ltc1qdest"), s!("bc1qrefund")),
                "minimum amount 0.000500 BTC",
            ),
        ];
        let total = cases.len();
        let seen: Arc<Mutex<Vec<(usize, Result<ExchangeSession, Error>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        for (index, (fut, _)) in cases.into_iter().enumerate() {
            let seen = seen.clone();
            actix::spawn(fut.then(move |res| {
                let mut seen = seen.lock();
                seen.push((index, res));
                if seen.len() == total {
                    System::current().stop();
                }
                Ok(())
            }));
        }
        sys.run();
        let mut outcomes = seen.lock().clone();
        outcomes.sort_by_key(|(index, _)| *index);
        let expected = [
            "invalid crypto (from)",
            "invalid crypto (to)",
            "invalid address",
            "invalid address",
            "route unavailable",
            "minimum amount 0.000500 BTC",
        ];
        for ((_, outcome), want) in outcomes.iter().zip(expected.iter()) {
            match outcome {
                Err(Error::Validation(message)) => assert_eq!(message, want),
                other => panic!("expected {:?}, got {:?}", want, other),
            }
        }
        assert!(sessions.read().is_empty());
    }

    #[test]
    fn minimum_amount_boundary_is_inclusive() {
        let sys = System::new("fsm-minimum");
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        *to_wallet.balance.lock() = 100.0;
        let exchange = test_exchange(from_wallet, to_wallet);
        let slot: Arc<Mutex<Option<Result<ExchangeSession, Error>>>> = Arc::new(Mutex::new(None));
        create_in_system(exchange, 0.001, "ltc1qdest", "bc1qrefund", slot.clone(), true);
        sys.run();
        let session = slot.lock().take().unwrap().expect("exact minimum accepted");
        assert_eq!(session.status, Status::Created);
        assert_eq!(session.order_id.len(), 16);
        assert!(session.order_id.chars().all(|c| c.is_ascii_hexdigit()
            && !c.is_ascii_uppercase()));
        assert_eq!(session.collection_time, -1);
        assert_eq!(session.fee_rate_percent, 1.0);
        assert!(session.from_transaction.is_blank());
    }

    #[test]
    fn maintenance_rejects_creation() {
        let sys = System::new("fsm-maintenance");
        let from_wallet = ScriptedWallet::arc();
        let to_wallet = ScriptedWallet::arc();
        *to_wallet.balance.lock() = 100.0;
        let exchange = test_exchange(from_wallet, to_wallet);
        exchange.maintenance.store(true, Ordering::SeqCst);
        let slot: Arc<Mutex<Option<Result<ExchangeSession, Error>>>> = Arc::new(Mutex::new(None));
        create_in_system(exchange.clone(), 0.01, "ltc1qdest", "bc1qrefund", slot.clone(), true);
        sys.run();
        match slot.lock().take().unwrap() {
            Err(Error::Maintenance) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s!(Error::Maintenance), "Service is under maintenance");
        assert!(exchange.sessions.read().is_empty());
    }

    #[test]
    fn order_ids_are_random_hex() {
        let a = generate_order_id();
        let b = generate_order_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| "0123456789abcdef".contains(c)));
    }

    #[test]
    fn status_ordering_and_terminality() {
        assert!(Status::Created < Status::AwaitingInput);
        assert!(Status::AwaitingInput < Status::ConfirmingInput);
        assert!(Status::ConfirmingInput < Status::Exchanging);
        assert!(Status::Exchanging < Status::ConfirmingOutput);
        assert!(Status::ConfirmingOutput < Status::Success);
        assert!(!Status::Exchanging.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::TranslationFailed.is_terminal());
        assert_eq!(s!(Status::AwaitingInput), "AWAITING INPUT");
        assert_eq!(s!(Status::TranslationFailed), "TRANSLATION FAILED");
    }
}
