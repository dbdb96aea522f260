use crate::errors::Error;
use actix_web::client::{self, ClientRequestBuilder};
use actix_web::http::header;
use actix_web::HttpMessage;
use base64::encode;
use futures::future::{self, Either, Future};
use openssl::hash::{hash, MessageDigest};
use rand::{thread_rng, Rng};
use serde_json::Value;
use std::str::from_utf8;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RPC_BODY_LIMIT: usize = 10 * 1024 * 1024;

pub trait PlainHttpAuth {
    fn auth(&mut self, username: &str, password: &str) -> &mut Self;
}

impl PlainHttpAuth for ClientRequestBuilder {
    fn auth(&mut self, username: &str, password: &str) -> &mut Self {
        let auth = format!("{}:{}", username, password);
        let auth_header = format!("Basic {}", encode(&auth));
        self.header(header::AUTHORIZATION, auth_header)
    }
}

/// Authentication schemes spoken by the wallet daemons we drive.
#[derive(Clone)]
pub enum RpcAuth {
    None,
    Basic { username: String, password: String },
    Digest { username: String, password: String },
}

/// POSTs a JSON-RPC request body and returns the decoded `result` member.
///
/// A JSON `error` member is surfaced as [`Error::RpcError`] so callers can
/// match daemon error texts. Digest-authenticated endpoints get the usual
/// 401 challenge round trip.
pub fn rpc_call(
    url: &str,
    auth: &RpcAuth,
    body: Value,
) -> Box<dyn Future<Item = Value, Error = Error>> {
    match auth {
        RpcAuth::Digest { username, password } => {
            digest_rpc_call(url, username.clone(), password.clone(), body)
        }
        _ => {
            let request = match build_request(url, auth, &body) {
                Ok(r) => r,
                Err(e) => return Box::new(future::err(e)),
            };
            Box::new(send_and_decode(request))
        }
    }
}

fn build_request(
    url: &str,
    auth: &RpcAuth,
    body: &Value,
) -> Result<client::ClientRequest, Error> {
    let mut builder = client::post(url);
    builder.header(header::CONTENT_TYPE, "application/json");
    if let RpcAuth::Basic { username, password } = auth {
        builder.auth(username, password);
    }
    builder
        .json(body)
        .map_err(|e| Error::WalletAPIError(s!(e)))
}

fn send_and_decode(
    request: client::ClientRequest,
) -> impl Future<Item = Value, Error = Error> {
    request
        .send()
        .timeout(RPC_TIMEOUT)
        .map_err(|e| Error::WalletAPIError(s!(e)))
        .and_then(decode_response)
}

/// Decodes the response body as a JSON-RPC envelope. The daemons report
/// call failures with a JSON `error` member and a non-2xx status at the
/// same time, so the body is decoded regardless of the status line.
fn decode_response(
    resp: client::ClientResponse,
) -> impl Future<Item = Value, Error = Error> {
    let status = resp.status();
    resp.body()
        .limit(RPC_BODY_LIMIT)
        .map_err(|e| Error::WalletAPIError(s!(e)))
        .and_then(move |bytes| match serde_json::from_slice::<Value>(&bytes) {
            Ok(tree) => unwrap_rpc_result(tree),
            Err(_) if !status.is_success() => Err(Error::WalletAPIError(format!(
                "Error status: {}",
                status
            ))),
            Err(e) => {
                log::error!(
                    "Cannot decode json {:?}:\n with error {} ",
                    from_utf8(&bytes),
                    e
                );
                Err(Error::WalletAPIError(format!("Cannot decode json {}", e)))
            }
        })
}

fn unwrap_rpc_result(mut tree: Value) -> Result<Value, Error> {
    if let Some(err) = tree.get("error") {
        if !err.is_null() {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned();
            return Err(Error::RpcError(code, message));
        }
    }
    match tree.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(Error::WalletAPIError(s!("response has no result member"))),
    }
}

/// One round of the RFC 2617 dance: an unauthenticated POST collects the
/// challenge, the second request carries the digest response.
fn digest_rpc_call(
    url: &str,
    username: String,
    password: String,
    body: Value,
) -> Box<dyn Future<Item = Value, Error = Error>> {
    let url = url.to_owned();
    let first = match build_request(&url, &RpcAuth::None, &body) {
        Ok(r) => r,
        Err(e) => return Box::new(future::err(e)),
    };
    Box::new(
        first
            .send()
            .timeout(RPC_TIMEOUT)
            .map_err(|e| Error::WalletAPIError(s!(e)))
            .and_then(move |resp| {
                if resp.status().as_u16() != 401 {
                    // Endpoint turned out to be unauthenticated.
                    return Either::A(decode_response(resp));
                }
                let challenge = resp
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let fut = match challenge {
                    None => Either::A(future::err(Error::WalletAPIError(s!(
                        "401 without WWW-Authenticate header"
                    )))),
                    Some(challenge) => {
                        let header_value = match DigestChallenge::parse(&challenge) {
                            Ok(ch) => ch.answer(&username, &password, "POST", uri_path(&url)),
                            Err(e) => return Either::B(Either::A(future::err(e))),
                        };
                        let mut builder = client::post(&url);
                        builder
                            .header(header::CONTENT_TYPE, "application/json")
                            .header(header::AUTHORIZATION, header_value);
                        match builder.json(&body) {
                            Ok(request) => Either::B(send_and_decode(request)),
                            Err(e) => Either::A(future::err(Error::WalletAPIError(s!(e)))),
                        }
                    }
                };
                Either::B(Either::B(fut))
            }),
    )
}

fn uri_path(url: &str) -> &str {
    url.find("://")
        .and_then(|scheme| url[scheme + 3..].find('/').map(|i| &url[scheme + 3 + i..]))
        .unwrap_or("/")
}

fn md5_hex(data: &str) -> String {
    match hash(MessageDigest::md5(), data.as_bytes()) {
        Ok(digest) => crate::ser::to_hex(&digest),
        Err(_) => String::new(),
    }
}

#[derive(Debug, PartialEq)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
}

impl DigestChallenge {
    fn parse(header: &str) -> Result<DigestChallenge, Error> {
        let header = header.trim();
        if !header.starts_with("Digest ") {
            return Err(Error::WalletAPIError(format!(
                "unsupported auth challenge: {}",
                header
            )));
        }
        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;
        for part in header["Digest ".len()..].split(',') {
            let mut kv = part.trim().splitn(2, '=');
            let key = kv.next().unwrap_or("");
            let value = kv.next().unwrap_or("").trim_matches('"').to_owned();
            match key {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => qop = Some(value),
                "opaque" => opaque = Some(value),
                _ => (),
            }
        }
        match (realm, nonce) {
            (Some(realm), Some(nonce)) => Ok(DigestChallenge {
                realm,
                nonce,
                qop,
                opaque,
            }),
            _ => Err(Error::WalletAPIError(s!("incomplete digest challenge"))),
        }
    }

    fn answer(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let nc = "00000001";
        let mut cnonce_bytes = [0u8; 8];
        thread_rng().fill(&mut cnonce_bytes);
        let cnonce = crate::ser::to_hex(&cnonce_bytes);
        let response = match self.qop.as_ref() {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, nc, cnonce, qop, ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri, response
        );
        if let Some(qop) = self.qop.as_ref() {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        if let Some(opaque) = self.opaque.as_ref() {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}
