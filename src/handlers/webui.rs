use crate::app::AppState;
use crate::config::AssetConfig;
use crate::errors::Error;
use crate::fsm::{Driver, Exchange};
use crate::handlers::{format_crypto_value, TemplateIntoResponse};
use crate::store::{convert, convert_without_fee};
use actix_web::{AsyncResponder, Form, FutureResponse, HttpResponse, Query, State};
use askama::Template;
use futures::future::{self, Future};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct IndexQuery {
    #[serde(default)]
    pub action: String,
    #[serde(default, rename = "fromId")]
    pub from_id: i64,
    #[serde(default, rename = "toId")]
    pub to_id: i64,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default, rename = "addressRefund")]
    pub address_refund: String,
}

pub struct RateDisplay {
    pub from: String,
    pub to: String,
    pub rate: String,
}

pub struct ReserveDisplay {
    pub name: String,
    pub balance: String,
    pub sign: String,
}

pub struct ConversionView {
    pub from_asset: String,
    pub to_asset: String,
    pub rate: String,
    pub fee_percent: String,
    pub amount_after_fee: String,
    pub rate_per_unit: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    cryptos: Vec<AssetConfig>,
    rates: Vec<RateDisplay>,
    reserves: Vec<ReserveDisplay>,
    conversion: Option<ConversionView>,
    error: String,
    form: IndexQuery,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
}

/// The index drives the whole exchange form: plain visits render rates and
/// reserves, `action=calc` adds a fee-aware quote, `action=exec` creates
/// the session and redirects to its order page.
pub fn index(
    (query, state): (Query<IndexQuery>, State<AppState>),
) -> FutureResponse<HttpResponse> {
    let exchange = state.exchange.clone();
    let query = query.into_inner();
    if query.action == "exec" {
        return exec_exchange(exchange, query);
    }
    render_index(exchange, query, String::new())
        .from_err()
        .responder()
}

/// Validates and registers the session, spawns its driver, and sends the
/// user to the order page. Failures re-render the index with the error.
fn exec_exchange(exchange: Exchange, query: IndexQuery) -> FutureResponse<HttpResponse> {
    let render_exchange = exchange.clone();
    let spawn_exchange = exchange.clone();
    exchange
        .create_session(
            query.from_id,
            query.to_id,
            query.amount,
            query.address.clone(),
            query.address_refund.clone(),
        )
        .then(move |res| match res {
            Ok(session) => {
                let order_id = session.order_id.clone();
                Driver::spawn(spawn_exchange, order_id.clone());
                future::Either::A(future::ok(
                    HttpResponse::SeeOther()
                        .header("location", format!("/order?orderID={}", order_id))
                        .finish(),
                ))
            }
            Err(e) => {
                let error = match e {
                    Error::Maintenance => s!(Error::Maintenance),
                    e => format!("Exchange failed: {}", e),
                };
                future::Either::B(render_index(render_exchange, query, error))
            }
        })
        .from_err()
        .responder()
}

fn render_index(
    exchange: Exchange,
    query: IndexQuery,
    error: String,
) -> impl Future<Item = HttpResponse, Error = Error> {
    let balances: Vec<_> = exchange
        .handlers
        .iter()
        .map(|(internal_id, handler)| {
            let internal_id = *internal_id;
            handler.check_balance().then(move |res| {
                let balance = res.unwrap_or_else(|e| {
                    log::error!("Error getting balance for asset {}: {}", internal_id, e);
                    0.0
                });
                Ok::<_, Error>((internal_id, balance))
            })
        })
        .collect();
    future::join_all(balances).and_then(move |balances| {
        let reserves = balances
            .into_iter()
            .filter_map(|(internal_id, balance)| {
                exchange.config.asset(internal_id).map(|asset| ReserveDisplay {
                    name: asset.asset_name.clone(),
                    balance: format_crypto_value(balance, asset.precision),
                    sign: asset.asset_sign.clone(),
                })
            })
            .collect();

        let rates = exchange
            .config
            .routes
            .iter()
            .filter_map(|route| {
                let (from_id, to_id) = (route.pair.id_from, route.pair.id_to);
                convert_without_fee(&exchange.store, from_id, to_id, 1.0)
                    .ok()
                    .map(|rate| RateDisplay {
                        from: exchange.store.asset_name(from_id),
                        to: exchange.store.asset_name(to_id),
                        rate: format_crypto_value(
                            rate,
                            exchange
                                .config
                                .asset(to_id)
                                .map(|asset| asset.precision)
                                .unwrap_or(8),
                        ),
                    })
            })
            .collect();

        let mut error = error;
        let mut conversion = None;
        if query.action == "calc" && query.from_id > 0 && query.to_id > 0 && query.amount > 0.0 {
            let to_precision = exchange
                .config
                .asset(query.to_id)
                .map(|asset| asset.precision)
                .unwrap_or(8);
            match exchange.store.get_fee(query.from_id, query.to_id) {
                None => error = s!("Route unavailable"),
                Some(fee) => {
                    match convert(&exchange.store, query.from_id, query.to_id, query.amount) {
                        Ok(after_fee) => {
                            let gross = after_fee / (1.0 - fee);
                            conversion = Some(ConversionView {
                                from_asset: exchange.store.asset_name(query.from_id),
                                to_asset: exchange.store.asset_name(query.to_id),
                                rate: format_crypto_value(gross, to_precision),
                                fee_percent: format_crypto_value(fee * 100.0, 2),
                                amount_after_fee: format_crypto_value(after_fee, to_precision),
                                rate_per_unit: format_crypto_value(
                                    gross / query.amount,
                                    to_precision,
                                ),
                            });
                        }
                        Err(_) => error = s!("Conversion failed"),
                    }
                }
            }
        }

        IndexTemplate {
            cryptos: exchange.config.supported_cryptos.clone(),
            rates,
            reserves,
            conversion,
            error,
            form: query,
        }
        .into_response()
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "fromId")]
    pub from_id: i64,
    #[serde(rename = "toId")]
    pub to_id: i64,
    pub amount: f64,
    pub address: String,
    #[serde(rename = "addressRefund")]
    pub address_refund: String,
}

/// Form-encoded equivalent of `action=exec` for programmatic callers.
pub fn create_session(
    (form, state): (Form<CreateSessionRequest>, State<AppState>),
) -> FutureResponse<HttpResponse> {
    let exchange = state.exchange.clone();
    let form = form.into_inner();
    exchange
        .create_session(
            form.from_id,
            form.to_id,
            form.amount,
            form.address,
            form.address_refund,
        )
        .then(move |res| match res {
            Ok(session) => {
                let order_id = session.order_id.clone();
                Driver::spawn(exchange, order_id.clone());
                Ok(HttpResponse::SeeOther()
                    .header("location", format!("/order?orderID={}", order_id))
                    .finish())
            }
            Err(Error::Maintenance) => ErrorTemplate {
                message: s!(Error::Maintenance),
            }
            .into_response(),
            Err(e) => ErrorTemplate {
                message: format!("Exchange failed: {}", e),
            }
            .into_response(),
        })
        .from_err()
        .responder()
}
