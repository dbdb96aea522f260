use crate::config::Config;
use crate::errors::Error;
use crate::fsm::ExchangeSession;
use crate::qrcode;
use crate::wallets::CryptoTransaction;
use actix_web::{FutureResponse, HttpResponse};
use askama::Template;
use chrono::Utc;
use futures::future::ok;
use mime_guess::get_mime_type;

pub mod order;
pub mod webui;

pub trait TemplateIntoResponse {
    fn into_response(&self) -> Result<HttpResponse, Error>;
    fn into_future(&self) -> FutureResponse<HttpResponse, Error>;
}

impl<T: Template> TemplateIntoResponse for T {
    fn into_response(&self) -> Result<HttpResponse, Error> {
        let rsp = self.render().map_err(|e| Error::Template(s!(e)))?;
        let ctype = get_mime_type(T::extension().unwrap_or("txt")).to_string();
        Ok(HttpResponse::Ok().content_type(ctype.as_str()).body(rsp))
    }
    fn into_future(&self) -> FutureResponse<HttpResponse, Error> {
        Box::new(ok(self.into_response().into()))
    }
}

/// Fixed-precision rendering with trailing zeros trimmed, like the rest of
/// the exchange UI shows amounts.
pub fn format_crypto_value(amount: f64, precision: u32) -> String {
    let formatted = format!("{:.*}", precision as usize, amount);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        s!("0")
    } else {
        trimmed.to_owned()
    }
}

/// Remaining lifetime of an order as `MM:SS`; clamped at `00:00`.
pub fn format_expiration_time(expiration_time: i64) -> String {
    let remaining = expiration_time - Utc::now().timestamp();
    if remaining <= 0 {
        return s!("00:00");
    }
    format!("{:02}:{:02}", remaining / 60, remaining % 60)
}

pub struct ExplorerLink {
    pub name: &'static str,
    pub icon_path: &'static str,
    pub url: String,
}

pub struct OutputView {
    pub txid: String,
    pub confirmations: i64,
    pub explorers: Vec<ExplorerLink>,
}

/// Everything the order templates show, preformatted.
pub struct OrderView {
    pub order_id: String,
    pub status: String,
    pub from_sign: String,
    pub to_sign: String,
    pub send_amount: String,
    pub receive_amount: String,
    pub exchange_rate: String,
    pub fee_rate: String,
    pub from_address: String,
    pub to_address: String,
    pub refund_address: String,
    pub deposit_qr: String,
    pub expires_in: String,
    pub from_txid: String,
    pub from_confirmations: i64,
    pub from_conf: i64,
    pub from_explorers: Vec<ExplorerLink>,
    pub outputs: Vec<OutputView>,
    pub to_conf: i64,
    pub error_message: String,
}

fn explorer_links(tx: &CryptoTransaction) -> Vec<ExplorerLink> {
    tx.explorers
        .iter()
        .map(|explorer| ExplorerLink {
            name: explorer.name,
            icon_path: explorer.icon_path,
            url: explorer.url(&tx.txid),
        })
        .collect()
}

impl OrderView {
    pub fn new(session: &ExchangeSession, config: &Config) -> OrderView {
        let from_precision = config
            .asset(session.from_id)
            .map(|asset| asset.precision)
            .unwrap_or(8);
        let to_precision = config
            .asset(session.to_id)
            .map(|asset| asset.precision)
            .unwrap_or(8);
        let outputs = session
            .to_transactions
            .iter()
            .filter(|tx| !tx.is_blank())
            .map(|tx| OutputView {
                txid: tx.txid.clone(),
                confirmations: tx.confirmations,
                explorers: explorer_links(tx),
            })
            .collect();
        OrderView {
            order_id: session.order_id.clone(),
            status: s!(session.status),
            from_sign: session.from_sign.clone(),
            to_sign: session.to_sign.clone(),
            send_amount: format_crypto_value(session.send_amount, from_precision),
            receive_amount: format_crypto_value(session.receive_amount, to_precision),
            exchange_rate: format_crypto_value(session.exchange_rate, to_precision),
            fee_rate: format_crypto_value(session.fee_rate_percent, 2),
            from_address: session.from_address.clone(),
            to_address: session.to_address.clone(),
            refund_address: session.refund_address.clone(),
            deposit_qr: if session.from_address.is_empty() {
                String::new()
            } else {
                qrcode::as_data_url(&session.from_address)
            },
            expires_in: format_expiration_time(session.expiration_time),
            from_txid: session.from_transaction.txid.clone(),
            from_confirmations: session.from_transaction.confirmations,
            from_conf: session.from_conf,
            from_explorers: explorer_links(&session.from_transaction),
            outputs,
            to_conf: session.to_conf,
            error_message: session.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_value_trims_trailing_zeros() {
        assert_eq!(format_crypto_value(7.425, 8), "7.425");
        assert_eq!(format_crypto_value(0.01, 8), "0.01");
        assert_eq!(format_crypto_value(1.0, 8), "1");
        assert_eq!(format_crypto_value(0.0, 8), "0");
        assert_eq!(format_crypto_value(1234.5, 2), "1234.5");
        assert_eq!(format_crypto_value(0.123456789, 4), "0.1235");
    }

    #[test]
    fn expiration_countdown_format() {
        let now = Utc::now().timestamp();
        assert_eq!(format_expiration_time(now - 5), "00:00");
        let in_ninety = format_expiration_time(now + 90);
        assert!(in_ninety == "01:30" || in_ninety == "01:29");
        let in_ten_minutes = format_expiration_time(now + 600);
        assert!(in_ten_minutes == "10:00" || in_ten_minutes == "09:59");
    }
}
