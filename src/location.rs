//! Standort-Kollaborateur
//!
//! Der Kern fragt den Standort nur über diese Grenze ab; ein echtes
//! GPS-Backend bringt die einbettende Anwendung mit.

use crate::signaling::messages::LocationSample;
use chrono::Utc;

/// Kollaborateur-Grenze zum Geräte-GPS
pub trait LocationProvider: Send + Sync {
    /// Aktueller Standort, None wenn keiner verfügbar ist
    fn sample(&self) -> Option<LocationSample>;
}

/// Fester Standort, z.B. aus der Konfiguration
pub struct FixedLocationProvider {
    latitude: f64,
    longitude: f64,
    address: Option<String>,
}

impl FixedLocationProvider {
    pub fn new(latitude: f64, longitude: f64, address: Option<String>) -> Self {
        Self {
            latitude,
            longitude,
            address,
        }
    }
}

impl LocationProvider for FixedLocationProvider {
    fn sample(&self) -> Option<LocationSample> {
        Some(LocationSample {
            latitude: self.latitude,
            longitude: self.longitude,
            address: self.address.clone(),
            timestamp: Utc::now().timestamp_millis(),
        })
    }
}

/// Kein GPS-Backend vorhanden
pub struct NoLocationProvider;

impl LocationProvider for NoLocationProvider {
    fn sample(&self) -> Option<LocationSample> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_provider_stamps_current_time() {
        let provider = FixedLocationProvider::new(52.3676, 4.9041, Some("Home".to_string()));
        let sample = provider.sample().unwrap();
        assert_eq!(sample.latitude, 52.3676);
        assert!(sample.timestamp > 0);
    }

    #[test]
    fn test_no_provider_yields_nothing() {
        assert!(NoLocationProvider.sample().is_none());
    }
}
