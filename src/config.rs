use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::controller::ControllerSettings;
use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/homeassistant/quasar_load_balancer.json";

/// Load balancer settings, read from a JSON file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    /// Downstream listen host, where the charging controller connects to
    pub host: String,
    pub port: u16,
    #[serde(alias = "quasar_host")]
    pub charger_host: Option<String>,
    #[serde(alias = "quasar_port")]
    pub charger_port: u16,
    pub charger_unit_id: u8,
    /// Site fuse ceiling, W
    pub total_power_limit: u32,
    pub max_charge_power: u32,
    /// Width of the deadband below `total_power_limit`, W
    pub phase_voltage: u32,
    /// Debounce, seconds
    pub adjustment_delay: u64,
    /// Seconds
    pub cooldown_period: u64,
    /// Seconds
    pub request_timeout: u64,
    /// Seconds without a power sample before it is reported missing
    pub total_power_timeout: u64,
    pub mqtt: Option<MqttConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 5020,
            charger_host: None,
            charger_port: 502,
            charger_unit_id: 1,
            total_power_limit: 5750,
            max_charge_power: 3680,
            phase_voltage: 230,
            adjustment_delay: 10,
            cooldown_period: 15,
            request_timeout: 5,
            total_power_timeout: 60,
            mqtt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Household total power samples, a plain number or `{"value": n}`
    pub total_power_topic: String,
    pub limit_topic: Option<String>,
    pub charger_power_topic: Option<String>,
    pub total_power_missing_topic: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "evse-load-guard".to_string()
}

impl Config {
    /// Reads the configuration file. A missing or unreadable file yields the disabled default.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_json(&content),
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_json(content: &str) -> Self {
        serde_json::from_str(content).unwrap_or_else(|e| {
            warn!("invalid configuration, load balancer disabled: {}", e);
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.charger_host.is_none() {
            return Err(Error::Config("charger_host is not set".to_string()));
        }
        if self.phase_voltage >= self.total_power_limit {
            return Err(Error::Config(format!(
                "phase_voltage {} must be below total_power_limit {}",
                self.phase_voltage, self.total_power_limit
            )));
        }
        if self.max_charge_power == 0 || self.max_charge_power > i16::MAX as u32 {
            return Err(Error::Config(format!(
                "max_charge_power {} must be within 1..={}",
                self.max_charge_power,
                i16::MAX
            )));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            upper_limit: self.total_power_limit,
            lower_limit: self.total_power_limit.saturating_sub(self.phase_voltage),
            max_charge_power: self.max_charge_power,
            min_charge_power: 1,
            debounce_delay: Duration::from_secs(self.adjustment_delay),
            cooldown_period: Duration::from_secs(self.cooldown_period),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn total_power_timeout(&self) -> Duration {
        Duration::from_secs(self.total_power_timeout)
    }

    pub async fn listen_addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port).await
    }

    pub async fn charger_addr(&self) -> Result<SocketAddr> {
        let host = self
            .charger_host
            .as_deref()
            .ok_or_else(|| Error::Config("charger_host is not set".to_string()))?;
        resolve(host, self.charger_port).await
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Config(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{host}:{port} has no address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_disabled() {
        assert!(!Config::from_json("").enabled);
        assert!(!Config::from_json("[1, 2]").enabled);
        assert!(!Config::from_json("{}").enabled);
    }

    #[test]
    fn missing_file_is_disabled() {
        let config = Config::load(Path::new("/nonexistent/quasar_load_balancer.json"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn reads_original_keys() {
        let config = Config::from_json(
            r#"{
                "enabled": true,
                "quasar_host": "192.168.1.20",
                "quasar_port": 503,
                "total_power_limit": 5000,
                "max_charge_power": 3000,
                "mqtt": {"host": "broker", "total_power_topic": "home/power"}
            }"#,
        );
        assert!(config.enabled);
        assert_eq!(config.charger_host.as_deref(), Some("192.168.1.20"));
        assert_eq!(config.charger_port, 503);
        assert_eq!(config.port, 5020);
        config.validate().unwrap();

        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.client_id, "evse-load-guard");
        assert_eq!(mqtt.limit_topic, None);
    }

    #[test]
    fn settings_derive_deadband() {
        let config = Config {
            total_power_limit: 5000,
            max_charge_power: 3000,
            ..Config::default()
        };
        let settings = config.controller_settings();
        assert_eq!(settings.upper_limit, 5000);
        assert_eq!(settings.lower_limit, 4770);
        assert_eq!(settings.min_charge_power, 1);
        assert_eq!(settings.debounce_delay, Duration::from_secs(10));
        assert_eq!(settings.cooldown_period, Duration::from_secs(15));
    }

    #[test]
    fn rejects_unusable_limits() {
        let base = Config {
            enabled: true,
            charger_host: Some("charger".to_string()),
            ..Config::default()
        };
        assert!(base.validate().is_ok());

        let no_charger = Config {
            charger_host: None,
            ..base.clone()
        };
        assert!(no_charger.validate().is_err());

        let no_deadband = Config {
            phase_voltage: 6000,
            ..base.clone()
        };
        assert!(no_deadband.validate().is_err());

        let too_large = Config {
            max_charge_power: 40_000,
            ..base.clone()
        };
        assert!(too_large.validate().is_err());

        let zero = Config {
            max_charge_power: 0,
            ..base
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn resolves_listen_address() {
        let addr = Config::default().listen_addr().await.unwrap();
        assert_eq!(addr, "127.0.0.1:5020".parse().unwrap());
    }
}
