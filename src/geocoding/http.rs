// src/geocoding/http.rs
//
// Client for a Google-style JSON geocoding endpoint:
//   GET {base_url}?address=...&key=...
//   { "status": "OK", "results": [{ "formatted_address", "place_id",
//     "geometry": { "location": { "lat", "lng" } } }] }

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{GeocodeResult, Geocoder};
use crate::error::GeocodeError;

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeCandidate>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeCandidate {
    formatted_address: String,
    #[serde(default)]
    place_id: Option<String>,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

pub struct HttpGeocoder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGeocoder {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("entity_resolution/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build geocoder HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn interpret(body: GeocodeResponse) -> Result<Option<GeocodeResult>, GeocodeError> {
    let detail = body.error_message.unwrap_or_default();
    match body.status.as_str() {
        "OK" => Ok(body.results.into_iter().next().map(|c| GeocodeResult {
            formatted_address: c.formatted_address,
            latitude: c.geometry.location.lat,
            longitude: c.geometry.location.lng,
            place_key: c.place_id,
        })),
        "ZERO_RESULTS" => Ok(None),
        "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => Err(GeocodeError::Transient {
            message: format!("{} {}", body.status, detail).trim().to_string(),
            retry_after: None,
        }),
        other => Err(GeocodeError::Permanent(format!("{} {}", other, detail).trim().to_string())),
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>, GeocodeError> {
        let mut request = self.client.get(&self.base_url).query(&[("address", address)]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request.send().await.map_err(|e| GeocodeError::Transient {
            message: format!("request failed: {}", e),
            retry_after: None,
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GeocodeError::Transient {
                message: format!("geocoder returned {}", status),
                retry_after: retry_after(&response),
            });
        }
        if !status.is_success() {
            return Err(GeocodeError::Permanent(format!("geocoder returned {}", status)));
        }

        let body: GeocodeResponse = response
            .json()
            .await
            .map_err(|e| GeocodeError::Permanent(format!("malformed geocoder response: {}", e)))?;
        debug!("Geocoder answered {} for '{}'", body.status, address);
        interpret(body)
    }
}
