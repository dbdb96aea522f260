use crate::app::AppState;
use crate::errors::Error;
use crate::fsm::Status;
use crate::handlers::{OrderView, TemplateIntoResponse};
use actix_web::{HttpResponse, Query, State};
use askama::Template;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    #[serde(rename = "orderID")]
    pub order_id: String,
}

#[derive(Template)]
#[template(path = "created.html")]
struct CreatedTemplate {
    view: OrderView,
}

#[derive(Template)]
#[template(path = "awaiting_input.html")]
struct AwaitingInputTemplate {
    view: OrderView,
}

#[derive(Template)]
#[template(path = "confirming_input.html")]
struct ConfirmingInputTemplate {
    view: OrderView,
}

#[derive(Template)]
#[template(path = "exchanging.html")]
struct ExchangingTemplate {
    view: OrderView,
}

#[derive(Template)]
#[template(path = "confirming_output.html")]
struct ConfirmingOutputTemplate {
    view: OrderView,
}

#[derive(Template)]
#[template(path = "success.html")]
struct SuccessTemplate {
    view: OrderView,
}

#[derive(Template)]
#[template(path = "transaction_failed.html")]
struct TransactionFailedTemplate {
    view: OrderView,
}

/// One template per state, so each page shows exactly what matters in that
/// phase of the order.
pub fn order_page(
    (query, state): (Query<OrderQuery>, State<AppState>),
) -> Result<HttpResponse, Error> {
    let session = state
        .exchange
        .sessions
        .read()
        .get(&query.order_id)
        .cloned()
        .ok_or_else(|| Error::EntityNotFound(s!("order")))?;
    let view = OrderView::new(&session, &state.exchange.config);
    match session.status {
        Status::Created => CreatedTemplate { view }.into_response(),
        Status::AwaitingInput => AwaitingInputTemplate { view }.into_response(),
        Status::ConfirmingInput => ConfirmingInputTemplate { view }.into_response(),
        Status::Exchanging => ExchangingTemplate { view }.into_response(),
        Status::ConfirmingOutput => ConfirmingOutputTemplate { view }.into_response(),
        Status::Success => SuccessTemplate { view }.into_response(),
        Status::TranslationFailed => TransactionFailedTemplate { view }.into_response(),
    }
}
