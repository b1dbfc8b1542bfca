//! Wire types of the provider's JSON API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fleet::{GeoLocation, Pricing, Vehicle, VehicleState};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PhoneRequest<'a> {
    pub(crate) phone_country_code: &'a str,
    pub(crate) phone_number: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub(crate) access_token: &'a str,
    pub(crate) refresh_token: &'a str,
}

/// Returned by both sign-up and token refresh; other fields are ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
}

/// Error body. The API is not consistent about it, so everything is optional.
#[derive(Deserialize)]
pub(crate) struct ProviderError {
    pub(crate) error: Option<String>,
    pub(crate) message: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct DevicesResponse {
    pub(crate) devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Device {
    pub(crate) identifier: String,
    pub(crate) latitude: f64,
    pub(crate) longitude: f64,
    pub(crate) energy_level: f64,
    #[serde(default)]
    pub(crate) broken: bool,
    #[serde(default)]
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) state_updated_by_user_identifier: Option<String>,
    #[serde(default)]
    pub(crate) init_price: u64,
    /// Per-minute rate.
    #[serde(default)]
    pub(crate) price: u64,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub(crate) last_gnss_update: i64,
    #[serde(default)]
    pub(crate) zone_identifier: Option<String>,
}

impl Device {
    pub(crate) fn into_vehicle(self, provider: &str) -> Vehicle {
        let state = if self.broken {
            VehicleState::Broken
        } else {
            match self.state.as_str() {
                "IN_USE" | "RIDING" | "RESERVED" => VehicleState::InUse,
                _ => VehicleState::IdleRentable,
            }
        };

        Vehicle {
            id: self.identifier,
            provider: provider.to_string(),
            state,
            location: GeoLocation::new(self.latitude, self.longitude),
            charge_level: self.energy_level,
            last_update: DateTime::<Utc>::from_timestamp_millis(self.last_gnss_update)
                .unwrap_or_default(),
            pricing: Pricing {
                init_fee: self.init_price,
                per_minute: self.price,
            },
            state_updated_by: self
                .state_updated_by_user_identifier
                .filter(|u| !u.is_empty()),
            zone: self.zone_identifier,
        }
    }
}

/// Decodes a device listing into vehicles of `provider`.
pub fn parse_devices(provider: &str, body: &[u8]) -> Result<Vec<Vehicle>, serde_json::Error> {
    let resp: DevicesResponse = serde_json::from_slice(body)?;
    Ok(resp
        .devices
        .into_iter()
        .map(|d| d.into_vehicle(provider))
        .collect())
}
