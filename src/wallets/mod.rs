//! Wallet backends for the supported asset families.
//!
//! Every family exposes the same capability set through [`CryptoHandler`];
//! the differences (auth scheme, unit scaling, keystore lifecycle, the
//! meaning of the start marker) stay inside the concrete variants.

pub mod ethereum;
pub mod keystore;
pub mod monero;
pub mod node_wallet;

use crate::errors::Error;
use futures::future::{self, Future};
use futures::stream::Stream;
use futures::sync::{mpsc, oneshot};
use tiny_keccak::Keccak;

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::new_keccak256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

pub(crate) fn env_var(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::General(format!("{} must be set", name)))
}

/// A deposit address plus the watermark separating payments made for this
/// session from older activity on the same address. The marker is a UNIX
/// timestamp for the time-scanned chains and a block height for the
/// account-model chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoAddress {
    pub address: String,
    pub start_marker: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Explorer {
    pub name: &'static str,
    pub icon_path: &'static str,
    pub url_prefix: &'static str,
}

impl Explorer {
    pub fn url(&self, txid: &str) -> String {
        format!("{}{}", self.url_prefix, txid)
    }
}

/// Amounts are whole units of the asset, never atomic units.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoTransaction {
    pub txid: String,
    pub confirmations: i64,
    pub amount: f64,
    pub explorers: &'static [Explorer],
}

impl CryptoTransaction {
    /// The "no transaction yet" placeholder. `"nil"` is not a valid txid on
    /// any supported chain.
    pub fn blank() -> CryptoTransaction {
        CryptoTransaction {
            txid: s!("nil"),
            confirmations: 0,
            amount: 0.0,
            explorers: &[],
        }
    }

    pub fn is_blank(&self) -> bool {
        self.txid == "nil"
    }
}

pub trait CryptoHandler: Send + Sync {
    /// One-time startup probe: makes sure the backing wallet exists, is
    /// loaded and answers.
    fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>>;

    fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>>;

    /// Whole-unit spendable balance of the whole wallet.
    fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>>;

    /// Earliest inbound payment to the address since its start marker, or
    /// `None` while nothing arrived yet.
    fn get_address_transaction(
        &self,
        address: &CryptoAddress,
    ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>>;

    fn get_transaction_details(
        &self,
        txid: &str,
    ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>>;

    /// Pays `amount` (whole units) to the address, network fee subtracted
    /// from the amount. The account-model variant may return several txids.
    /// Callers must go through [`HandlerRef::send`], which serializes sends.
    fn send(
        &self,
        address: &CryptoAddress,
        amount: f64,
    ) -> Box<dyn Future<Item = Vec<String>, Error = Error>>;

    /// Operator maintenance: sweep dust accounts together. Only meaningful
    /// for the account-model variant; a no-op elsewhere.
    fn consolidate(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        Box::new(future::ok(()))
    }
}

struct SendJob {
    address: CryptoAddress,
    amount: f64,
    reply: oneshot::Sender<Result<Vec<String>, Error>>,
}

/// Serializes `send` calls to one wallet. Wallet-side coin selection races
/// when two spends are built concurrently, so jobs are queued onto a single
/// worker future that finishes one send (success or failure) before starting
/// the next.
#[derive(Clone)]
pub struct SendGate {
    tx: mpsc::UnboundedSender<SendJob>,
}

impl SendGate {
    /// Spawns the worker on the current arbiter.
    pub fn start(wallet: std::sync::Arc<dyn CryptoHandler>) -> SendGate {
        let (tx, rx) = mpsc::unbounded::<SendJob>();
        actix::spawn(rx.for_each(move |job| {
            wallet.send(&job.address, job.amount).then(move |res| {
                let _ = job.reply.send(res);
                Ok(())
            })
        }));
        SendGate { tx }
    }

    pub fn send(
        &self,
        address: CryptoAddress,
        amount: f64,
    ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
        let (reply, rx) = oneshot::channel();
        let job = SendJob {
            address,
            amount,
            reply,
        };
        if self.tx.unbounded_send(job).is_err() {
            return Box::new(future::err(Error::General(s!("send gate is gone"))));
        }
        Box::new(rx.then(|res| match res {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::General(s!("send gate dropped the reply"))),
        }))
    }
}

/// A wallet backend together with its send gate; this is what the rest of
/// the engine holds and clones.
#[derive(Clone)]
pub struct HandlerRef {
    wallet: std::sync::Arc<dyn CryptoHandler>,
    gate: SendGate,
}

impl HandlerRef {
    pub fn new(wallet: std::sync::Arc<dyn CryptoHandler>) -> HandlerRef {
        let gate = SendGate::start(wallet.clone());
        HandlerRef { wallet, gate }
    }

    pub fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        self.wallet.ensure_ready()
    }

    pub fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
        self.wallet.generate_new_address()
    }

    pub fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>> {
        self.wallet.check_balance()
    }

    pub fn get_address_transaction(
        &self,
        address: &CryptoAddress,
    ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
        self.wallet.get_address_transaction(address)
    }

    pub fn get_transaction_details(
        &self,
        txid: &str,
    ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
        self.wallet.get_transaction_details(txid)
    }

    pub fn send(
        &self,
        address: CryptoAddress,
        amount: f64,
    ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
        self.gate.send(address, amount)
    }

    pub fn consolidate(&self) -> Box<dyn Future<Item = (), Error = Error>> {
        self.wallet.consolidate()
    }
}

pub fn round_to_digits(val: f64, digits: i32) -> f64 {
    let pow = 10f64.powi(digits);
    (val * pow).round() / pow
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{task, Async, Poll};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn rounds_to_eight_digits() {
        assert_eq!(round_to_digits(0.123456789, 8), 0.12345679);
        assert_eq!(round_to_digits(1.0, 8), 1.0);
        assert_eq!(round_to_digits(0.1 + 0.2, 8), 0.3);
        assert_eq!(round_to_digits(12.345678994, 8), 12.34567899);
    }

    /// Completes on the second poll, so two queued jobs overlap unless the
    /// gate really serializes them.
    struct YieldingSend {
        polled: bool,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl Future for YieldingSend {
        type Item = Vec<String>;
        type Error = Error;

        fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
            if !self.polled {
                self.polled = true;
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                task::current().notify();
                return Ok(Async::NotReady);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Async::Ready(vec![s!("txid")]))
        }
    }

    struct SlowWallet {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl CryptoHandler for SlowWallet {
        fn ensure_ready(&self) -> Box<dyn Future<Item = (), Error = Error>> {
            Box::new(future::ok(()))
        }
        fn generate_new_address(&self) -> Box<dyn Future<Item = CryptoAddress, Error = Error>> {
            unimplemented!()
        }
        fn check_balance(&self) -> Box<dyn Future<Item = f64, Error = Error>> {
            unimplemented!()
        }
        fn get_address_transaction(
            &self,
            _address: &CryptoAddress,
        ) -> Box<dyn Future<Item = Option<CryptoTransaction>, Error = Error>> {
            unimplemented!()
        }
        fn get_transaction_details(
            &self,
            _txid: &str,
        ) -> Box<dyn Future<Item = CryptoTransaction, Error = Error>> {
            unimplemented!()
        }
        fn send(
            &self,
            _address: &CryptoAddress,
            _amount: f64,
        ) -> Box<dyn Future<Item = Vec<String>, Error = Error>> {
            Box::new(YieldingSend {
                polled: false,
                active: self.active.clone(),
                max_active: self.max_active.clone(),
            })
        }
    }

    #[test]
    fn gate_serializes_concurrent_sends() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let max_for_check = max_active.clone();

        let sys = actix::System::new("gate-test");
        let wallet = Arc::new(SlowWallet { active, max_active });
        let handler = HandlerRef::new(wallet);
        let address = CryptoAddress {
            address: s!("addr"),
            start_marker: 0,
        };
        let first = handler.send(address.clone(), 1.0);
        let second = handler.send(address, 2.0);
        actix::spawn(first.join(second).then(|res| {
            let (a, b) = res.expect("both sends succeed");
            assert_eq!(a, vec![s!("txid")]);
            assert_eq!(b, vec![s!("txid")]);
            actix::System::current().stop();
            Ok(())
        }));
        sys.run();
        assert_eq!(max_for_check.load(Ordering::SeqCst), 1);
    }
}
