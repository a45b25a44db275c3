use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::errors::{Result, SortieError};

/// Link used to reach the flight controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Udp,
    Tcp,
    Serial,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Serial => "serial",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = SortieError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "serial" => Ok(Self::Serial),
            other => Err(SortieError::configuration_field(
                format!("DRONE_CONNECTION_TYPE must be one of udp, tcp, serial (got '{}')", other),
                "DRONE_CONNECTION_TYPE",
            )),
        }
    }
}

/// Tuning knobs for the job coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Ask the vehicle to return to launch once the mission ends
    #[serde(default = "default_return_to_launch")]
    pub return_to_launch: bool,
    /// Maximum telemetry samples buffered between collector and publisher
    #[serde(default = "default_telemetry_buffer")]
    pub telemetry_buffer_capacity: usize,
}

fn default_return_to_launch() -> bool {
    true
}

fn default_telemetry_buffer() -> usize {
    100
}

fn default_download_root() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            return_to_launch: default_return_to_launch(),
            telemetry_buffer_capacity: default_telemetry_buffer(),
        }
    }
}

/// Runtime configuration of the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Enable debug logging
    #[serde(default)]
    pub verbose: bool,
    /// Job queue endpoint
    pub endpoint: String,
    /// Device identity used for topics and telemetry
    pub thing_name: String,

    // Flight controller link
    pub drone_address: String,
    pub drone_port: u16,
    pub drone_connection_type: ConnectionType,

    // Transport credentials
    pub cert_filepath: PathBuf,
    pub pri_key_filepath: PathBuf,
    pub ca_filepath: PathBuf,

    /// Telemetry sampling rate in Hz
    pub telemetry_sample_interval: u32,
    /// Samples per published telemetry batch
    pub telemetry_sample_count: usize,

    pub stream_sample_rate: u32,
    pub stream_port: u16,

    /// Mission downloads must land below this directory
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment-style keys)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| -> Result<String> {
            lookup(key)
                .ok_or_else(|| SortieError::configuration_field(format!("{} not set", key), key))
        };

        let config = Self {
            verbose: lookup("VERBOSE").map(|v| parse_flag(&v)).unwrap_or(false),
            endpoint: require("IOT_ENDPOINT")?,
            thing_name: require("IOT_THING_NAME")?,
            drone_address: require("DRONE_ADDRESS")?,
            drone_port: parse_number(&require("DRONE_PORT")?, "DRONE_PORT")?,
            drone_connection_type: require("DRONE_CONNECTION_TYPE")?.parse()?,
            cert_filepath: PathBuf::from(require("CERT_FILEPATH")?),
            pri_key_filepath: PathBuf::from(require("PRIVATE_KEY_FILEPATH")?),
            ca_filepath: PathBuf::from(require("CA_FILEPATH")?),
            telemetry_sample_interval: parse_number(
                &require("TELEMETRY_SAMPLE_INTERVAL")?,
                "TELEMETRY_SAMPLE_INTERVAL",
            )?,
            telemetry_sample_count: parse_number(
                &require("TELEMETRY_SAMPLE_COUNT")?,
                "TELEMETRY_SAMPLE_COUNT",
            )?,
            stream_sample_rate: parse_number(
                &require("STREAM_SAMPLE_RATE")?,
                "STREAM_SAMPLE_RATE",
            )?,
            stream_port: parse_number(&require("STREAM_PORT")?, "STREAM_PORT")?,
            download_root: lookup("DOWNLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(default_download_root),
            coordinator: CoordinatorConfig {
                return_to_launch: lookup("RETURN_TO_LAUNCH")
                    .map(|v| parse_flag(&v))
                    .unwrap_or_else(default_return_to_launch),
                ..CoordinatorConfig::default()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SortieError::io(format!("read config {}", path.display()), e))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.thing_name.trim().is_empty() {
            return Err(SortieError::configuration_field(
                "thing name must not be empty",
                "IOT_THING_NAME",
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(SortieError::configuration_field(
                "endpoint must not be empty",
                "IOT_ENDPOINT",
            ));
        }

        for (key, path) in [
            ("CERT_FILEPATH", &self.cert_filepath),
            ("PRIVATE_KEY_FILEPATH", &self.pri_key_filepath),
            ("CA_FILEPATH", &self.ca_filepath),
        ] {
            if !path.is_file() {
                return Err(SortieError::configuration_field(format!("{} not a file", key), key));
            }
        }

        if self.telemetry_sample_interval == 0 {
            return Err(SortieError::configuration_field(
                "telemetry sample interval must be greater than 0",
                "TELEMETRY_SAMPLE_INTERVAL",
            ));
        }
        if self.telemetry_sample_count == 0 {
            return Err(SortieError::configuration_field(
                "telemetry sample count must be greater than 0",
                "TELEMETRY_SAMPLE_COUNT",
            ));
        }
        if self.stream_sample_rate == 0 {
            return Err(SortieError::configuration_field(
                "stream sample rate must be greater than 0",
                "STREAM_SAMPLE_RATE",
            ));
        }
        if !self.download_root.is_absolute() {
            return Err(SortieError::configuration_field(
                "download root must be absolute",
                "DOWNLOAD_ROOT",
            ));
        }
        if self.coordinator.telemetry_buffer_capacity == 0 {
            return Err(SortieError::configuration(
                "telemetry buffer capacity must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Topic the job queue notifies on when the queue changes
    pub fn job_notification_topic(&self) -> String {
        format!("$aws/things/{}/jobs/notify", self.thing_name)
    }

    pub fn telemetry_topic(&self) -> String {
        format!("devices/{}/telemetry", self.thing_name)
    }

    /// Topic carrying `{"enabled": bool}` live-stream toggles
    pub fn streaming_control_topic(&self) -> String {
        format!("devices/{}/streaming", self.thing_name)
    }

    /// Address handed to the flight controller driver
    pub fn drone_connection_string(&self) -> String {
        let separator = match self.drone_connection_type {
            ConnectionType::Serial => ":///",
            _ => "://",
        };
        format!(
            "{}{}{}:{}",
            self.drone_connection_type, separator, self.drone_address, self.drone_port
        )
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SortieError::configuration_field(format!("{} must be integer", key), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    struct Fixture {
        _files: Vec<NamedTempFile>,
        vars: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            let files: Vec<NamedTempFile> = (0..3).map(|_| NamedTempFile::new().unwrap()).collect();
            let mut vars = HashMap::new();
            for (key, value) in [
                ("IOT_ENDPOINT", "example.iot.local"),
                ("IOT_THING_NAME", "drone-7"),
                ("DRONE_ADDRESS", "127.0.0.1"),
                ("DRONE_PORT", "14540"),
                ("DRONE_CONNECTION_TYPE", "udp"),
                ("TELEMETRY_SAMPLE_INTERVAL", "2"),
                ("TELEMETRY_SAMPLE_COUNT", "10"),
                ("STREAM_SAMPLE_RATE", "5"),
                ("STREAM_PORT", "5600"),
            ] {
                vars.insert(key.to_string(), value.to_string());
            }
            for (key, file) in ["CERT_FILEPATH", "PRIVATE_KEY_FILEPATH", "CA_FILEPATH"]
                .iter()
                .zip(&files)
            {
                vars.insert(key.to_string(), file.path().display().to_string());
            }
            Self { _files: files, vars }
        }

        fn load(&self) -> Result<Config> {
            Config::from_lookup(|key| self.vars.get(key).cloned())
        }
    }

    #[test]
    fn test_loads_complete_environment() {
        let fixture = Fixture::new();
        let config = fixture.load().unwrap();

        assert_eq!(config.thing_name, "drone-7");
        assert_eq!(config.drone_port, 14540);
        assert_eq!(config.drone_connection_type, ConnectionType::Udp);
        assert!(!config.verbose);
        assert_eq!(config.download_root, PathBuf::from("/tmp"));
        assert!(config.coordinator.return_to_launch);
        assert_eq!(config.job_notification_topic(), "$aws/things/drone-7/jobs/notify");
        assert_eq!(config.telemetry_topic(), "devices/drone-7/telemetry");
        assert_eq!(config.streaming_control_topic(), "devices/drone-7/streaming");
    }

    #[test]
    fn test_missing_key_is_reported() {
        let mut fixture = Fixture::new();
        fixture.vars.remove("DRONE_ADDRESS");
        let err = fixture.load().unwrap_err();
        assert!(matches!(
            err,
            SortieError::Configuration { ref field, .. }
                if field.as_deref() == Some("DRONE_ADDRESS")
        ));
    }

    #[test]
    fn test_non_integer_port_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.vars.insert("DRONE_PORT".into(), "abc".into());
        let err = fixture.load().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: DRONE_PORT must be integer");
    }

    #[test]
    fn test_unknown_connection_type_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.vars.insert("DRONE_CONNECTION_TYPE".into(), "carrier-pigeon".into());
        assert!(fixture.load().is_err());
    }

    #[test]
    fn test_missing_certificate_file_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.vars.insert("CA_FILEPATH".into(), "/definitely/not/here.pem".into());
        let err = fixture.load().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: CA_FILEPATH not a file");
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.vars.insert("TELEMETRY_SAMPLE_COUNT".into(), "0".into());
        assert!(fixture.load().is_err());
    }

    #[test]
    fn test_verbose_flag() {
        let mut fixture = Fixture::new();
        fixture.vars.insert("VERBOSE".into(), "True".into());
        assert!(fixture.load().unwrap().verbose);
    }

    #[test]
    fn test_connection_strings() {
        let fixture = Fixture::new();
        let mut config = fixture.load().unwrap();
        assert_eq!(config.drone_connection_string(), "udp://127.0.0.1:14540");

        config.drone_connection_type = ConnectionType::Serial;
        config.drone_address = "/dev/ttyACM0".into();
        config.drone_port = 57600;
        assert_eq!(config.drone_connection_string(), "serial:////dev/ttyACM0:57600");
    }

    #[test]
    fn test_yaml_round_trip() {
        let fixture = Fixture::new();
        let config = fixture.load().unwrap();

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_yaml_file(file.path()).unwrap();
        assert_eq!(loaded.thing_name, config.thing_name);
        assert_eq!(loaded.cert_filepath, config.cert_filepath);
        assert_eq!(loaded.coordinator.telemetry_buffer_capacity, 100);
    }
}
