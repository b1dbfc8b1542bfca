use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use std::sync::{Arc, RwLock};

/// Shared, replaceable access token.
pub type TokenSlot = Arc<RwLock<Option<String>>>;

/// An [`HttpClient`] wrapper that sends the current access token as the raw
/// `Authorization` header value.
///
/// The token lives in a [`TokenSlot`] so the owner can swap it after a login
/// or refresh without rebuilding the client. Requests go out without the
/// header while the slot is empty or holds a value that is not a valid
/// header.
pub struct AccessToken<C> {
    pub inner: C,
    pub token: TokenSlot,
}

impl<C> AccessToken<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            token: Arc::new(RwLock::new(None)),
        }
    }

    fn header_value(&self) -> Option<HeaderValue> {
        let guard = self.token.read().ok()?;
        let token = guard.as_deref()?;
        HeaderValue::from_str(token).ok()
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for AccessToken<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        if let Some(value) = self.header_value() {
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        self.inner.execute(req).await
    }
}
