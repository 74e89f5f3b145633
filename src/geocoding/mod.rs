// src/geocoding/mod.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GeocodeError;

pub mod cached;
pub mod http;

pub use cached::{CachedGeocoder, GeocoderSettings};
pub use http::HttpGeocoder;

/// The part of a geocoder answer the engine keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub formatted_address: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Provider-side place id, when the service returns one.
    pub place_key: Option<String>,
}

/// External geocoding service. `Ok(None)` means the service answered and
/// found nothing.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>, GeocodeError>;
}

/// Great-circle distance in meters.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}
