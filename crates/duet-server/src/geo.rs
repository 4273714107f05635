//! Best-effort IP-to-country lookup over HTTP.
//!
//! Consulted once per connection, after the connection is already matching.
//! Every failure path yields [`UNKNOWN_COUNTRY`].

use crate::matching::registry::UNKNOWN_COUNTRY;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// JSON fields checked, in order, for the country label.
const COUNTRY_FIELDS: [&str; 3] = ["country_code", "countryCode", "country"];

pub struct GeoResolver {
    client: reqwest::Client,
    /// URL template with an `{ip}` placeholder. `None` disables lookups.
    endpoint: Option<String>,
}

impl GeoResolver {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "geo client build failed, using defaults");
                reqwest::Client::new()
            });
        Self { client, endpoint }
    }

    /// A resolver that never performs lookups.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(1))
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Resolve `ip` to a country label.
    pub async fn country_for(&self, ip: IpAddr) -> String {
        let Some(template) = &self.endpoint else {
            return UNKNOWN_COUNTRY.to_string();
        };
        if !is_routable(&ip) {
            return UNKNOWN_COUNTRY.to_string();
        }

        let url = template.replace("{ip}", &ip.to_string());
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(%ip, error = %e, "geo lookup failed");
                return UNKNOWN_COUNTRY.to_string();
            }
        };
        if !response.status().is_success() {
            warn!(%ip, status = %response.status(), "geo lookup rejected");
            return UNKNOWN_COUNTRY.to_string();
        }
        match response.json::<serde_json::Value>().await {
            Ok(body) => {
                let country = extract_country(&body);
                debug!(%ip, country = %country, "geo lookup resolved");
                country
            }
            Err(e) => {
                warn!(%ip, error = %e, "geo response not JSON");
                UNKNOWN_COUNTRY.to_string()
            }
        }
    }
}

/// Pull the country label out of a lookup response.
fn extract_country(body: &serde_json::Value) -> String {
    COUNTRY_FIELDS
        .iter()
        .filter_map(|field| body.get(*field).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
}

/// Addresses a public geolocation database can say something about.
fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique local, fe80::/10 link local
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}
