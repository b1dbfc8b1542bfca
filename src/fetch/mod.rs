mod client;
mod basic;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Request, StatusCode, Url};

/// Status and body of a completed HTTP exchange. Error statuses are left to
/// the caller to interpret.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Bytes,
}

async fn send<C: HttpClient>(client: &C, mut req: Request) -> reqwest::Result<HttpReply> {
    req.headers_mut()
        .insert(ACCEPT, HeaderValue::from_static("application/json"));

    let resp = client.execute(req).await?;
    let status = resp.status();
    let body = resp.bytes().await?;
    Ok(HttpReply { status, body })
}

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: Url) -> reqwest::Result<HttpReply> {
    send(client, Request::new(Method::GET, url)).await
}

/// POSTs an already serialized JSON document.
pub async fn post_json<C: HttpClient>(
    client: &C,
    url: Url,
    body: Vec<u8>,
) -> reqwest::Result<HttpReply> {
    let mut req = Request::new(Method::POST, url);
    req.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    *req.body_mut() = Some(body.into());
    send(client, req).await
}
