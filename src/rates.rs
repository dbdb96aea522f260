//! Streaming price feed: one long-lived actor holding a websocket
//! subscription to the price aggregator, pushing every quote frame into the
//! price store. Connection loss at any stage (dial, subscribe, read) leads
//! to a full reconnect with exponential backoff.

use crate::store::PriceStore;
use actix::prelude::*;
use actix_web::ws::{Client, ClientWriter, Message as WsMessage, ProtocolError};
use log::{debug, error, info};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const FEED_URL: &str = "wss://push.coinmarketcap.com/ws?device=web&client_source=coin_detail_page";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PriceFrame {
    d: PriceData,
}

#[derive(Debug, Deserialize)]
struct PriceData {
    id: i64,
    p: f64,
}

pub struct PriceFeed {
    store: Arc<PriceStore>,
    subscription_ids: String,
    writer: Option<ClientWriter>,
    backoff: Duration,
}

impl PriceFeed {
    pub fn new(store: Arc<PriceStore>, external_ids: &[i64]) -> PriceFeed {
        let subscription_ids = external_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        PriceFeed {
            store,
            subscription_ids,
            writer: None,
            backoff: INITIAL_BACKOFF,
        }
    }

    fn connect(&mut self, ctx: &mut Context<Self>) {
        debug!("Connecting to price feed {}", FEED_URL);
        let connect = Client::new(FEED_URL)
            .header("Origin", "https://coinmarketcap.com")
            .header(
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
            )
            .connect()
            .into_actor(self)
            .map(|(reader, mut writer), act, ctx| {
                info!("Connected to price feed");
                let subscribe = format!(
                    "{{\"method\":\"RSUBSCRIPTION\",\"params\":[\"main-site@crypto_price_15s@{{}}@normal\",\"{}\"]}}",
                    act.subscription_ids
                );
                writer.text(subscribe);
                ctx.add_stream(reader);
                act.writer = Some(writer);
                act.backoff = INITIAL_BACKOFF;
            })
            .map_err(|e, act, ctx| {
                error!("Price feed connection error: {}", e);
                act.schedule_reconnect(ctx);
            });
        ctx.spawn(connect);
    }

    fn schedule_reconnect(&mut self, ctx: &mut Context<Self>) {
        self.writer = None;
        let delay = self.backoff;
        self.backoff = std::cmp::min(self.backoff * 2, MAX_BACKOFF);
        debug!("Reconnecting to price feed in {:?}", delay);
        ctx.run_later(delay, |act, ctx| act.connect(ctx));
    }

    fn handle_frame(&mut self, text: &str) {
        match serde_json::from_str::<PriceFrame>(text) {
            Ok(frame) => self.store.update(frame.d.id, frame.d.p),
            // Heartbeats and acks share the channel; ignore them.
            Err(_) => (),
        }
    }
}

impl Actor for PriceFeed {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Starting price feed");
        self.connect(ctx);
    }
}

/// Stops the feed; the subscription is not re-established afterwards.
pub struct StopFeed;

impl Message for StopFeed {
    type Result = ();
}

impl Handler<StopFeed> for PriceFeed {
    type Result = ();

    fn handle(&mut self, _: StopFeed, ctx: &mut Context<Self>) {
        ctx.stop();
    }
}

impl StreamHandler<WsMessage, ProtocolError> for PriceFeed {
    fn handle(&mut self, msg: WsMessage, _ctx: &mut Context<Self>) {
        match msg {
            WsMessage::Text(text) => self.handle_frame(&text),
            WsMessage::Ping(ping) => {
                if let Some(writer) = self.writer.as_mut() {
                    writer.pong(&ping);
                }
            }
            _ => (),
        }
    }

    fn error(&mut self, err: ProtocolError, _ctx: &mut Context<Self>) -> Running {
        error!("Price feed read error: {}", err);
        Running::Stop
    }

    /// Read side ended: reconnect (with the current backoff) instead of
    /// stopping the actor.
    fn finished(&mut self, ctx: &mut Context<Self>) {
        self.schedule_reconnect(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn feed_with_store() -> (PriceFeed, Arc<PriceStore>) {
        let config: Config = serde_json::from_str(
            r#"{
              "supportedCryptos": [
                {"internalAssetID": 1, "coinmarketcapAssetID": 101, "assetName": "Bitcoin",
                 "addressRegex": ".*", "assetSign": "BTC", "precision": 8, "confirmationsNeeded": 1}
              ],
              "routes": []
            }"#,
        )
        .unwrap();
        let store = Arc::new(PriceStore::new(&config));
        let feed = PriceFeed::new(store.clone(), &[101, 102]);
        (feed, store)
    }

    #[test]
    fn quote_frames_reach_the_store() {
        let (mut feed, store) = feed_with_store();
        feed.handle_frame(r#"{"d":{"id":101,"p":60000.5}}"#);
        assert_eq!(store.get(1), Some(60000.5));
        // Non-quote frames and garbage are ignored.
        feed.handle_frame(r#"{"ack":"subscribed"}"#);
        feed.handle_frame("not json at all");
        assert_eq!(store.get(1), Some(60000.5));
    }

    #[test]
    fn subscription_list_joins_ids() {
        let (feed, _) = feed_with_store();
        assert_eq!(feed.subscription_ids, "101,102");
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let (mut feed, _) = feed_with_store();
        assert_eq!(feed.backoff, Duration::from_secs(1));
        for _ in 0..10 {
            feed.backoff = std::cmp::min(feed.backoff * 2, MAX_BACKOFF);
        }
        assert_eq!(feed.backoff, MAX_BACKOFF);
    }
}
