#[macro_use]
mod macros;

mod app;
mod blocking;
mod clients;
mod config;
mod console;
mod cron;
mod crypt;
mod errors;
mod fsm;
mod handlers;
mod logging;
mod qrcode;
mod rates;
mod ser;
mod store;
mod wallets;

use crate::fsm::Exchange;
use crate::store::PriceStore;
use actix::prelude::*;
use actix_web::server;
use dotenv::dotenv;
use futures::future::Future;
use log::info;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

fn main() {
    dotenv().ok();

    env_logger::init();

    let log_dir = env::var("LOG_DIR").unwrap_or("./logs".to_owned());
    logging::init(&log_dir).expect("Failed to initialize logging");

    std::fs::create_dir_all("./styles").expect("Failed to create styles directory");

    let config_path = env::var("CONFIG_PATH").unwrap_or("SupportedCryptos.json".to_owned());
    let config = config::load_config(&config_path).expect("Failed to load config");
    let host = env::var("HOST").unwrap_or("0.0.0.0:3000".to_owned());

    let sys = actix::System::new("exchange-allee");

    let handlers = Arc::new(config::build_handlers(&config));
    for (internal_id, handler) in handlers.iter() {
        let internal_id = *internal_id;
        actix::spawn(handler.ensure_ready().then(move |res| {
            match res {
                Ok(()) => info!("Wallet backend for asset {} is ready", internal_id),
                Err(e) => log_error!("Wallet backend for asset {} failed: {}", internal_id, e),
            }
            Ok(())
        }));
    }

    let store = Arc::new(PriceStore::new(&config));
    let sessions = fsm::new_registry();
    let maintenance = Arc::new(AtomicBool::new(false));
    let exchange = Exchange {
        sessions: sessions.clone(),
        store: store.clone(),
        handlers: handlers.clone(),
        config: Arc::new(config.clone()),
        maintenance: maintenance.clone(),
    };

    info!("Starting");
    let external_ids: Vec<i64> = config
        .supported_cryptos
        .iter()
        .map(|crypto| crypto.coinmarketcap_asset_id)
        .collect();
    let _feed = Arbiter::start({
        let store = store.clone();
        move |_| rates::PriceFeed::new(store, &external_ids)
    });
    let _cron = Arbiter::start({
        let sessions = sessions.clone();
        move |_| cron::Cron::new(sessions)
    });

    let commands = console::spawn_command_worker(handlers.clone());
    thread::spawn({
        let sessions = sessions.clone();
        let maintenance = maintenance.clone();
        move || console::command_loop(sessions, maintenance, commands)
    });

    let mut srv = server::new({
        let exchange = exchange.clone();
        move || app::create_app(exchange.clone())
    });

    srv = if let Ok(folder) = env::var("TLS_FOLDER") {
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        builder
            .set_private_key_file(format!("{}/privkey.pem", folder), SslFiletype::PEM)
            .unwrap();
        builder
            .set_certificate_chain_file(format!("{}/fullchain.pem", folder))
            .unwrap();
        srv.bind_ssl(&host, builder)
            .expect(&format!("Can not bind_ssl to '{}'", &host))
    } else {
        srv.bind(&host)
            .expect(&format!("Can not bind to '{}'", &host))
    };
    srv.start();
    sys.run();
}
