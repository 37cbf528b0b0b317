//! Top-level JSON configuration, mirroring `usb_monitor_parse_config` and
//! friends in `examples/original_source/src/usb_monitor.c`.

use std::path::Path;

use serde::Deserialize;

use crate::model::path::TopologyPath;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub handlers: Vec<Handler>,
    #[serde(default)]
    pub disable_auto_restart: bool,
    #[serde(default)]
    pub bad_vid_pids: Vec<BadVidPid>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "name", deny_unknown_fields)]
pub enum Handler {
    #[serde(rename = "GPIO")]
    Gpio { ports: Vec<GpioPortConfig> },
    #[serde(rename = "Lanner")]
    Lanner {
        mcu_path: String,
        mcu_lock_path: String,
        ports: Vec<LannerPortConfig>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpioPortConfig {
    pub path: Vec<TopologyPath>,
    #[serde(default)]
    pub gpio_num: Option<u32>,
    #[serde(default)]
    pub gpio_path: Option<String>,
    #[serde(default)]
    pub on_val: Option<u8>,
    #[serde(default)]
    pub off_val: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LannerPortConfig {
    pub path: Vec<TopologyPath>,
    pub bit: u8,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BadVidPid {
    pub vid: u16,
    pub pid: u16,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("GPIO port must set exactly one of gpio_num/gpio_path")]
    GpioAddrAmbiguous,
    #[error("bad_vid_pids entry has vid or pid unset")]
    BadVidPidUnset,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for handler in &self.handlers {
            if let Handler::Gpio { ports } = handler {
                for port in ports {
                    match (port.gpio_num, &port.gpio_path) {
                        (Some(_), None) | (None, Some(_)) => {}
                        _ => return Err(ConfigError::GpioAddrAmbiguous),
                    }
                }
            }
        }
        for bad in &self.bad_vid_pids {
            if bad.vid == 0 || bad.pid == 0 {
                return Err(ConfigError::BadVidPidUnset);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpio_handler() {
        let json = r#"{
            "handlers": [
                {"name": "GPIO", "ports": [
                    {"path": ["1-1"], "gpio_num": 4}
                ]}
            ],
            "disable_auto_restart": true,
            "bad_vid_pids": [{"vid": 4817, "pid": 5382}]
        }"#;
        let config = Config::parse(json).unwrap();
        assert!(config.disable_auto_restart);
        assert_eq!(config.bad_vid_pids.len(), 1);
        match &config.handlers[0] {
            Handler::Gpio { ports } => {
                assert_eq!(ports[0].gpio_num, Some(4));
            }
            Handler::Lanner { .. } => panic!("expected GPIO handler"),
        }
    }

    #[test]
    fn rejects_ambiguous_gpio_addressing() {
        let json = r#"{"handlers": [
            {"name": "GPIO", "ports": [
                {"path": ["1-1"], "gpio_num": 4, "gpio_path": "/sys/foo"}
            ]}
        ]}"#;
        assert!(matches!(
            Config::parse(json),
            Err(ConfigError::GpioAddrAmbiguous)
        ));
    }

    #[test]
    fn rejects_unknown_handler_fields() {
        let json = r#"{"handlers": [
            {"name": "GPIO", "ports": [], "bogus": 1}
        ]}"#;
        assert!(Config::parse(json).is_err());
    }

    #[test]
    fn parses_lanner_handler() {
        let json = r#"{"handlers": [
            {"name": "Lanner", "mcu_path": "/dev/ttyS1", "mcu_lock_path": "/var/lock/mcu",
             "ports": [{"path": ["1-1"], "bit": 3}]}
        ]}"#;
        let config = Config::parse(json).unwrap();
        match &config.handlers[0] {
            Handler::Lanner { ports, mcu_path, .. } => {
                assert_eq!(mcu_path, "/dev/ttyS1");
                assert_eq!(ports[0].bit, 3);
            }
            Handler::Gpio { .. } => panic!("expected Lanner handler"),
        }
    }
}
