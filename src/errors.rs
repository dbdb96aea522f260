use crate::blocking::BlockingError;
use actix::MailboxError;
use actix_web::{error::ResponseError, HttpResponse};
use failure::Fail;

#[derive(Fail, Debug, Clone)]
pub enum Error {
    #[fail(display = "{}", _0)]
    Validation(String),

    #[fail(display = "Entity not found: {}", _0)]
    EntityNotFound(String),

    #[fail(display = "Template erorr")]
    Template(String),

    #[fail(display = "General error: {}", _0)]
    General(String),

    #[fail(display = "Got error when call wallet API {}", _0)]
    WalletAPIError(String),

    #[fail(display = "Got error when call Node API {}", _0)]
    NodeAPIError(String),

    #[fail(display = "RPC error {}: {}", _0, _1)]
    RpcError(i64, String),

    #[fail(display = "price not available for {}", _0)]
    PriceNotAvailable(String),

    #[fail(display = "conversion fee not found for {} to {}", _0, _1)]
    FeeNotFound(String, String),

    #[fail(display = "insufficient funds")]
    NotEnoughFunds,

    #[fail(display = "Service is under maintenance")]
    Maintenance,
}

impl From<MailboxError> for Error {
    fn from(error: MailboxError) -> Self {
        Error::General(s!(error))
    }
}

impl From<BlockingError> for Error {
    fn from(error: BlockingError) -> Self {
        match error {
            BlockingError::Canceled => Error::General(s!("Got blocking error")),
            BlockingError::Error(e) => e,
        }
    }
}

impl From<askama::Error> for Error {
    fn from(error: askama::Error) -> Self {
        Error::Template(format!("{:?}", error))
    }
}

impl From<serde_json::error::Error> for Error {
    fn from(error: serde_json::error::Error) -> Self {
        Error::General(format!("{:?}", error))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::General(format!("{:?}", error))
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(error: openssl::error::ErrorStack) -> Self {
        Error::General(format!("{:?}", error))
    }
}

// impl ResponseError trait allows to convert our errors into http responses with appropriate data
impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        match *self {
            Error::Template(ref message) => HttpResponse::InternalServerError().json(message),
            Error::EntityNotFound(ref message) => HttpResponse::NotFound().json(message),
            Error::Validation(ref message) => HttpResponse::BadRequest().json(message),
            Error::Maintenance => HttpResponse::ServiceUnavailable().json(s!(self)),
            _ => HttpResponse::InternalServerError().json("general error".to_owned()),
        }
    }
}
