//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chandler_core::scanner::ScannerOptions;
use chandler_core::session::{
    MAX_PERSISTENT_INTERVAL, MIN_PERSISTENT_INTERVAL, clamp_persistent_interval,
};
use chandler_core::{DeviceOverrides, ManagerConfig, SessionConfig};
use chandler_types::Passcode;

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Polling settings.
    pub polling: PollingConfig,
    /// Authentication defaults.
    pub auth: AuthConfig,
    /// Passive scanner settings.
    pub scanner: ScannerConfig,
    /// Per-valve settings.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_or_default(default_config_path())
    }

    /// Load configuration from `path`, or defaults when the file does not exist.
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use chandler_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.polling.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.scanner.validate());

        let mut seen_addresses = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen_addresses.insert(device.address.to_lowercase()) {
                errors.push(ValidationError {
                    field: format!("{}.address", prefix),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the connection manager configuration.
    ///
    /// Call [`Config::validate`] first; invalid passcodes are rejected here too.
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let session = SessionConfig::default()
            .connect_timeout(Duration::from_secs(self.polling.connect_timeout))
            .response_timeout(Duration::from_secs(self.polling.response_timeout))
            .cooldown(Duration::from_secs(self.polling.cooldown))
            .passcode(parse_passcode("auth.passcode", &self.auth.passcode)?);

        let mut config = ManagerConfig::default()
            .poll_interval(Duration::from_secs(self.polling.interval))
            .startup_delay(Duration::from_secs(self.polling.startup_delay))
            .session(session);

        for (i, device) in self.devices.iter().enumerate() {
            let passcode = device
                .passcode
                .as_deref()
                .map(|p| parse_passcode(&format!("devices[{}].passcode", i), p))
                .transpose()?;
            config = config.device(
                device.address.clone(),
                DeviceOverrides {
                    passcode,
                    persistent: Some(device.persistent),
                    persistent_interval: Some(clamp_persistent_interval(Duration::from_secs(
                        device.persistent_interval,
                    ))),
                },
            );
        }
        config.validate()?;
        Ok(config)
    }

    /// Alias configured for an address.
    pub fn alias_for(&self, address: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.address.eq_ignore_ascii_case(address))
            .and_then(|d| d.alias.as_deref())
    }
}

fn parse_passcode(field: &str, value: &str) -> Result<Passcode, ConfigError> {
    value.parse().map_err(|_| {
        ConfigError::Validation(vec![ValidationError {
            field: field.to_string(),
            message: format!("passcode '{}' must be exactly 4 digits", value),
        }])
    })
}

/// Minimum full-poll interval in seconds (1 minute).
pub const MIN_POLL_INTERVAL: u64 = 60;
/// Maximum full-poll interval in seconds (24 hours).
pub const MAX_POLL_INTERVAL: u64 = 86_400;

/// Polling configuration. All values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval of the poll-everything timer.
    pub interval: u64,
    /// Delay before the first poll after startup.
    pub startup_delay: u64,
    /// Minimum gap between connection attempts to one valve.
    pub cooldown: u64,
    pub connect_timeout: u64,
    pub response_timeout: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: 15 * 60,
            startup_delay: 5,
            cooldown: 15,
            connect_timeout: 20,
            response_timeout: 5,
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&self.interval) {
            errors.push(ValidationError {
                field: "polling.interval".to_string(),
                message: format!(
                    "poll interval {} is out of range ({}-{} seconds)",
                    self.interval, MIN_POLL_INTERVAL, MAX_POLL_INTERVAL
                ),
            });
        }
        for (field, value) in [
            ("polling.cooldown", self.cooldown),
            ("polling.connect_timeout", self.connect_timeout),
            ("polling.response_timeout", self.response_timeout),
        ] {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: "must be at least 1 second".to_string(),
                });
            }
        }

        errors
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Default four-digit passcode.
    pub passcode: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            passcode: "1234".to_string(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_passcode("auth.passcode", &self.passcode)
            .into_iter()
            .collect()
    }
}

fn validate_passcode(field: &str, value: &str) -> Option<ValidationError> {
    let valid = value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit());
    (!valid).then(|| ValidationError {
        field: field.to_string(),
        message: format!("passcode '{}' must be exactly 4 digits", value),
    })
}

/// Passive scanner configuration. All values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Silence after which a valve is reported lost.
    pub stale_after: u64,
    /// How often silent valves are checked.
    pub sweep_interval: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let options = ScannerOptions::default();
        Self {
            stale_after: options.stale_after.as_secs(),
            sweep_interval: options.sweep_interval.as_secs(),
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.sweep_interval == 0 {
            errors.push(ValidationError {
                field: "scanner.sweep_interval".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        if self.stale_after < self.sweep_interval {
            errors.push(ValidationError {
                field: "scanner.stale_after".to_string(),
                message: format!(
                    "stale timeout {} is shorter than the sweep interval {}",
                    self.stale_after, self.sweep_interval
                ),
            });
        }
        errors
    }

    pub fn options(&self) -> ScannerOptions {
        ScannerOptions::new()
            .stale_after(Duration::from_secs(self.stale_after))
            .sweep_interval(Duration::from_secs(self.sweep_interval))
    }
}

/// Settings for one valve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Valve address (MAC, or peripheral UUID on macOS).
    pub address: String,
    /// Friendly alias used in output.
    #[serde(default)]
    pub alias: Option<String>,
    /// Passcode overriding `auth.passcode`.
    #[serde(default)]
    pub passcode: Option<String>,
    /// Keep the connection open and refresh the Dashboard periodically.
    #[serde(default)]
    pub persistent: bool,
    /// Persistent refresh interval in seconds.
    #[serde(default = "default_persistent_interval")]
    pub persistent_interval: u64,
}

fn default_persistent_interval() -> u64 {
    30
}

impl DeviceConfig {
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: "device address cannot be empty".to_string(),
            });
        }

        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{}.alias", prefix),
                message: "alias cannot be empty string (use null/omit instead)".to_string(),
            });
        }

        if let Some(passcode) = &self.passcode {
            errors.extend(validate_passcode(&format!("{}.passcode", prefix), passcode));
        }

        let min = MIN_PERSISTENT_INTERVAL.as_secs();
        let max = MAX_PERSISTENT_INTERVAL.as_secs();
        if !(min..=max).contains(&self.persistent_interval) {
            errors.push(ValidationError {
                field: format!("{}.persistent_interval", prefix),
                message: format!(
                    "persistent interval {} is out of range ({}-{} seconds)",
                    self.persistent_interval, min, max
                ),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
    #[error("Invalid engine settings: {0}")]
    Engine(#[from] chandler_core::Error),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `auth.passcode` or `devices[0].address`).
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chandler")
        .join("service.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_fields(config: &Config) -> Vec<String> {
        match config.validate() {
            Err(ConfigError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(()) => Vec::new(),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.polling.interval, 900);
        assert_eq!(config.auth.passcode, "1234");
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_device_config_defaults() {
        let config: DeviceConfig = toml::from_str(r#"address = "AA:BB:CC:DD:EE:FF""#).unwrap();
        assert_eq!(config.persistent_interval, 30);
        assert!(!config.persistent);
        assert_eq!(config.passcode, None);
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [polling]
            interval = 600
            cooldown = 20

            [auth]
            passcode = "0042"

            [scanner]
            stale_after = 120

            [[devices]]
            address = "AA:BB:CC:DD:EE:01"
            alias = "softener"
            passcode = "9876"
            persistent = true
            persistent_interval = 10
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.polling.connect_timeout, 20);
        assert_eq!(config.scanner.sweep_interval, 30);
        assert_eq!(config.alias_for("aa:bb:cc:dd:ee:01"), Some("softener"));

        let manager = config.manager_config().unwrap();
        assert_eq!(manager.poll_interval, Duration::from_secs(600));
        assert_eq!(manager.session.cooldown, Duration::from_secs(20));
        assert_eq!(manager.session.passcode, Passcode::new(42));

        let session = manager.session_config_for("AA:BB:CC:DD:EE:01");
        assert_eq!(session.passcode, Passcode::new(9876));
        assert!(session.persistent);
        assert_eq!(session.persistent_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = Config::default();
        config.polling.interval = 5;
        config.auth.passcode = "12a4".to_string();
        config.devices = vec![
            DeviceConfig {
                address: "AA:BB:CC:DD:EE:01".to_string(),
                alias: Some(String::new()),
                passcode: Some("123".to_string()),
                persistent: true,
                persistent_interval: 1,
            },
            DeviceConfig {
                address: "aa:bb:cc:dd:ee:01".to_string(),
                alias: None,
                passcode: None,
                persistent: false,
                persistent_interval: 30,
            },
        ];

        assert_eq!(
            validation_fields(&config),
            vec![
                "polling.interval",
                "auth.passcode",
                "devices[0].alias",
                "devices[0].passcode",
                "devices[0].persistent_interval",
                "devices[1].address",
            ]
        );
    }

    #[test]
    fn test_manager_config_rejects_bad_passcode() {
        let mut config = Config::default();
        config.auth.passcode = "abcd".to_string();
        assert!(matches!(
            config.manager_config(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_manager_config_checks_engine_settings() {
        let mut config = Config::default();
        config.polling.response_timeout = 0;
        assert!(matches!(
            config.manager_config(),
            Err(ConfigError::Engine(chandler_core::Error::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_scanner_stale_shorter_than_sweep() {
        let mut config = Config::default();
        config.scanner.stale_after = 10;
        assert_eq!(validation_fields(&config), vec!["scanner.stale_after"]);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("service.toml");

        let mut config = Config::default();
        config.devices.push(DeviceConfig {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            alias: Some("Filter".to_string()),
            passcode: None,
            persistent: false,
            persistent_interval: 60,
        });

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].alias.as_deref(), Some("Filter"));
        assert_eq!(loaded.devices[0].persistent_interval, 60);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_or_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("service.toml");

        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.polling.interval, Config::default().polling.interval);

        std::fs::write(&path, "[polling\ninterval = 60").unwrap();
        assert!(matches!(
            Config::load_or_default(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("chandler/service.toml"));
    }
}
