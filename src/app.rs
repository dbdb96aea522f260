use crate::fsm::Exchange;
use crate::handlers::{order, webui};
use actix_web::{fs, http::Method, middleware, App};

pub struct AppState {
    pub exchange: Exchange,
}

pub fn create_app(exchange: Exchange) -> App<AppState> {
    let state = AppState { exchange };
    App::with_state(state)
        .middleware(middleware::Logger::new("\"%r\" %s %b %Dms"))
        .handler(
            "/styles",
            fs::StaticFiles::new("./styles").expect("styles directory must exist"),
        )
        .resource("/", |r| {
            r.method(Method::GET).with(webui::index);
        })
        .resource("/session", |r| {
            r.method(Method::POST).with(webui::create_session);
        })
        .resource("/order", |r| {
            r.method(Method::GET).with(order::order_page);
        })
}
