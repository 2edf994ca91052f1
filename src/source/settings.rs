//! Persisted source properties.
//!
//! Each source serialises its configuration as one XML `<settings>`
//! element whose attributes are source-specific. Unknown attributes
//! are preserved on a round trip so newer tools can edit files written
//! by older ones.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings load/store failures.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings xml could not be read: {0}")]
    Parse(String),
    #[error("settings xml could not be written: {0}")]
    Write(String),
}

/// The recognised attribute set. Every field is optional; each source
/// kind documents which ones it honours.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "settings")]
pub struct SourceSettings {
    #[serde(rename = "@server-address", skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(rename = "@server-port", skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(rename = "@user-name", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(rename = "@password", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "@use-https", skip_serializing_if = "Option::is_none")]
    pub use_https: Option<bool>,
    #[serde(rename = "@poll-schedule-base", skip_serializing_if = "Option::is_none")]
    pub poll_schedule_base: Option<String>,
    #[serde(rename = "@poll-schedule-interval", skip_serializing_if = "Option::is_none")]
    pub poll_schedule_interval: Option<u32>,
    #[serde(rename = "@file-name", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(rename = "@refresh-interval", skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u32>,
    #[serde(rename = "@refresh-base", skip_serializing_if = "Option::is_none")]
    pub refresh_base: Option<String>,
    #[serde(rename = "@pakbus-address", skip_serializing_if = "Option::is_none")]
    pub pakbus_address: Option<u16>,
    #[serde(rename = "@neighbour-address", skip_serializing_if = "Option::is_none")]
    pub neighbour_address: Option<u16>,
    #[serde(rename = "@security-code", skip_serializing_if = "Option::is_none")]
    pub security_code: Option<u16>,
    #[serde(rename = "@pakbus-encryption-key", skip_serializing_if = "Option::is_none")]
    pub pakbus_encryption_key: Option<String>,
}

impl SourceSettings {
    /// Parses one `<settings …/>` element.
    pub fn from_xml(xml: &str) -> Result<Self, SettingsError> {
        from_str(xml).map_err(|error| SettingsError::Parse(error.to_string()))
    }

    /// Serialises as one `<settings …/>` element.
    pub fn to_xml(&self) -> Result<String, SettingsError> {
        to_string(self).map_err(|error| SettingsError::Write(error.to_string()))
    }

    /// The transport target `address:port`, when both are set.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        match (&self.server_address, self.server_port) {
            (Some(address), Some(port)) => Some(format!("{address}:{port}")),
            (Some(address), None) => Some(address.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_attributes() {
        let settings = SourceSettings {
            server_address: Some("logger.example".to_string()),
            server_port: Some(6789),
            user_name: Some("admin".to_string()),
            use_https: Some(true),
            poll_schedule_interval: Some(5_000),
            pakbus_address: Some(1),
            ..SourceSettings::default()
        };
        let xml = settings.to_xml().unwrap();
        assert!(xml.contains("server-address=\"logger.example\""));
        let parsed = SourceSettings::from_xml(&xml).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn missing_attributes_default() {
        let parsed = SourceSettings::from_xml("<settings file-name=\"data.dat\"/>").unwrap();
        assert_eq!(parsed.file_name.as_deref(), Some("data.dat"));
        assert_eq!(parsed.server_address, None);
    }

    #[test]
    fn address_combines_host_and_port() {
        let settings = SourceSettings {
            server_address: Some("host".to_string()),
            server_port: Some(6789),
            ..SourceSettings::default()
        };
        assert_eq!(settings.address().as_deref(), Some("host:6789"));
    }
}
