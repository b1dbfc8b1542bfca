use async_trait::async_trait;
use reqwest::Url;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{PhoneRequest, ProviderError, RefreshRequest, TokenResponse, parse_devices};
use crate::fetch::auth::AccessToken;
use crate::fetch::{HttpClient, HttpReply, fetch_bytes, post_json};
use crate::fleet::Vehicle;
use crate::infra::tokens::{TokenStore, Tokens};
use crate::services::fleet_api::{ApiError, CodePrompt, FleetApi};

/// Rectangle to query, given by its top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_top_left: f64,
    pub lon_top_left: f64,
    pub lat_bottom_right: f64,
    pub lon_bottom_right: f64,
}

impl BoundingBox {
    fn query_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("latitudeTopLeft", format!("{:.5}", self.lat_top_left)),
            ("longitudeTopLeft", format!("{:.5}", self.lon_top_left)),
            ("latitudeBottomRight", format!("{:.5}", self.lat_bottom_right)),
            ("longitudeBottomRight", format!("{:.5}", self.lon_bottom_right)),
        ]
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            lat_top_left: 51.582780,
            lon_top_left: 7.325945,
            lat_bottom_right: 51.475727,
            lon_bottom_right: 7.558172,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFleetApiConfig {
    /// Namespace stamped on every vehicle.
    pub provider: String,
    pub base_url: String,
    pub bbox: BoundingBox,
    /// Country prefix such as `+49`.
    pub phone_prefix: String,
    /// Phone number without the leading zero.
    pub phone_number: String,
    /// Tokens are refreshed at most this often.
    pub token_refresh_interval: Duration,
}

impl Default for HttpFleetApiConfig {
    fn default() -> Self {
        Self {
            provider: "circ".to_string(),
            base_url: "https://node.goflash.com/".to_string(),
            bbox: BoundingBox::default(),
            phone_prefix: "+49".to_string(),
            phone_number: String::new(),
            token_refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

struct Endpoints {
    login_start: Url,
    signup: Url,
    refresh: Url,
    devices: Url,
}

impl Endpoints {
    fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| ApiError::Config(format!("{base}: {e}")))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| ApiError::Config(format!("{path}: {e}")))
        };

        Ok(Self {
            login_start: join("verification/phone/start")?,
            signup: join("signup/phone")?,
            refresh: join("login/refresh")?,
            devices: join("devices")?,
        })
    }
}

#[derive(Default)]
struct Session {
    refresh_token: Option<String>,
    last_refresh: Option<Instant>,
}

/// [`FleetApi`] over the provider's JSON HTTP API.
pub struct HttpFleetApi<C> {
    client: AccessToken<C>,
    config: HttpFleetApiConfig,
    endpoints: Endpoints,
    session: Mutex<Session>,
    store: Option<Box<dyn TokenStore>>,
}

/// Maps an error status to an [`ApiError`]; 4xx means the session is no
/// longer accepted.
pub(crate) fn check_status(reply: &HttpReply) -> Result<(), ApiError> {
    let status = reply.status;
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(());
    }

    let message = match serde_json::from_slice::<ProviderError>(&reply.body) {
        Ok(ProviderError { error, message }) => {
            format!("{}: {}", error.unwrap_or_default(), message.unwrap_or_default())
        }
        Err(_) => String::from_utf8_lossy(&reply.body).chars().take(200).collect(),
    };

    if status.is_client_error() {
        Err(ApiError::AuthRequired {
            status: status.as_u16(),
            message,
        })
    } else {
        Err(ApiError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

fn login_error(e: ApiError) -> ApiError {
    match e {
        ApiError::AuthRequired { status, message } | ApiError::Server { status, message } => {
            ApiError::Login(format!("HTTP {status}: {message}"))
        }
        other => other,
    }
}

impl<C: HttpClient> HttpFleetApi<C> {
    /// Creates the client and restores the session from `store` if it holds
    /// tokens.
    pub async fn new(
        client: C,
        config: HttpFleetApiConfig,
        store: Option<Box<dyn TokenStore>>,
    ) -> Result<Self, ApiError> {
        let endpoints = Endpoints::new(&config.base_url)?;
        let api = Self {
            client: AccessToken::new(client),
            config,
            endpoints,
            session: Mutex::new(Session::default()),
            store,
        };

        if let Some(store) = &api.store {
            match store.load().await {
                Ok(tokens) => {
                    let mut session = api.session.lock().await;
                    api.install(&mut session, &tokens);
                    debug!("Restored stored session tokens");
                }
                Err(e) => debug!(error = %e, "No stored session tokens"),
            }
        }

        Ok(api)
    }

    fn install(&self, session: &mut Session, tokens: &Tokens) {
        let mut slot = self.client.token.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(tokens.access_token.clone());
        session.refresh_token = Some(tokens.refresh_token.clone());
    }

    async fn persist(&self, tokens: &Tokens) {
        if let Some(store) = &self.store {
            if let Err(e) = store.store(tokens).await {
                warn!(error = %e, "Failed to persist session tokens");
            }
        }
    }

    fn access_token(&self) -> String {
        let slot = self.client.token.read().unwrap_or_else(|e| e.into_inner());
        slot.clone().unwrap_or_default()
    }

    async fn refresh_if_due(&self) -> Result<(), ApiError> {
        let mut session = self.session.lock().await;
        let Some(refresh_token) = session.refresh_token.clone() else {
            return Ok(());
        };
        if session
            .last_refresh
            .is_some_and(|t| t.elapsed() < self.config.token_refresh_interval)
        {
            return Ok(());
        }
        session.last_refresh = Some(Instant::now());

        let access_token = self.access_token();
        let body = serde_json::to_vec(&RefreshRequest {
            access_token: &access_token,
            refresh_token: &refresh_token,
        })?;
        let reply = post_json(&self.client, self.endpoints.refresh.clone(), body).await?;
        check_status(&reply)?;

        let resp: TokenResponse = serde_json::from_slice(&reply.body)?;
        let tokens = Tokens {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
        };
        self.install(&mut session, &tokens);
        drop(session);

        debug!("Session tokens refreshed");
        self.persist(&tokens).await;
        Ok(())
    }
}

#[async_trait]
impl<C: HttpClient> FleetApi for HttpFleetApi<C> {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    #[tracing::instrument(skip(self), fields(provider = %self.config.provider))]
    async fn fetch_fleet(&self) -> Result<Vec<Vehicle>, ApiError> {
        self.refresh_if_due().await?;

        let mut url = self.endpoints.devices.clone();
        url.query_pairs_mut()
            .extend_pairs(self.config.bbox.query_pairs());

        let reply = fetch_bytes(&self.client, url).await?;
        check_status(&reply)?;

        match parse_devices(&self.config.provider, &reply.body) {
            Ok(vehicles) => {
                debug!(vehicles = vehicles.len(), bytes = reply.body.len(), "Fleet fetched");
                Ok(vehicles)
            }
            Err(e) => {
                let preview: String = String::from_utf8_lossy(&reply.body).chars().take(200).collect();
                warn!(status = %reply.status, body = %preview, "Unexpected device listing");
                Err(e.into())
            }
        }
    }

    #[tracing::instrument(skip(self, prompt), fields(provider = %self.config.provider))]
    async fn reauthenticate(&self, prompt: &dyn CodePrompt) -> Result<(), ApiError> {
        let start = serde_json::to_vec(&PhoneRequest {
            phone_country_code: &self.config.phone_prefix,
            phone_number: &self.config.phone_number,
            token: None,
        })?;
        let reply = post_json(&self.client, self.endpoints.login_start.clone(), start).await?;
        check_status(&reply).map_err(login_error)?;

        let code = prompt
            .one_time_code()
            .await
            .map_err(|e| ApiError::Login(format!("no one-time code: {e}")))?;

        let signup = serde_json::to_vec(&PhoneRequest {
            phone_country_code: &self.config.phone_prefix,
            phone_number: &self.config.phone_number,
            token: Some(code.trim()),
        })?;
        let reply = post_json(&self.client, self.endpoints.signup.clone(), signup).await?;
        check_status(&reply).map_err(login_error)?;

        let resp: TokenResponse = serde_json::from_slice(&reply.body)?;
        let tokens = Tokens {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
        };

        let mut session = self.session.lock().await;
        self.install(&mut session, &tokens);
        session.last_refresh = Some(Instant::now());
        drop(session);

        self.persist(&tokens).await;
        info!("Logged in");
        Ok(())
    }
}
