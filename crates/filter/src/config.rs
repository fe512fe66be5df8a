//! Filter configuration management

use anyhow::{Context, Result, anyhow};
use common::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub filter: FilterSettings,
    /// Redirection policy
    #[serde(default)]
    pub policy: PolicySettings,
    /// Host topology mirroring (CLI only)
    #[serde(default)]
    pub host: HostSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default = "FilterSettings::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Hardware ids identifying a USB root hub; filters only attach to
    /// devices reporting one of them
    #[serde(default = "FilterSettings::default_root_hub_ids")]
    pub root_hub_ids: Vec<String>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: LogFormat::default(),
            root_hub_ids: Self::default_root_hub_ids(),
        }
    }
}

impl FilterSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_root_hub_ids() -> Vec<String> {
        vec!["USB\\ROOT_HUB".to_string(), "USB\\ROOT_HUB20".to_string()]
    }
}

/// What to expose for a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectAction {
    /// Stack a redirector PDO above the device
    Redirect,
    /// Leave the device to its native driver
    #[default]
    Native,
}

/// Redirection rule
///
/// # Example Configuration
/// ```toml
/// [[policy.rules]]
/// device_filter = "0x046d:*"  # Logitech devices
/// action = "redirect"
///
/// [[policy.rules]]
/// device_filter = "0x1234:0x5678"
/// instance_prefix = "1-2"     # Only on this port
/// action = "redirect"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Device filter pattern ("0xVID:0xPID", either side may be "*")
    #[serde(alias = "filter")]
    pub device_filter: String,
    /// Only match devices with an instance id starting with this prefix
    #[serde(default)]
    pub instance_prefix: Option<String>,
    pub action: RedirectAction,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Action for devices no rule matches
    #[serde(default)]
    pub default_action: RedirectAction,
    #[serde(default)]
    pub rules: Vec<RedirectRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Interval between host topology scans in watch mode
    #[serde(default = "HostSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl HostSettings {
    fn default_poll_interval() -> u64 {
        1000
    }
}

impl FilterConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-redirector/filter.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: FilterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-redirector").join("filter.toml")
        } else {
            PathBuf::from(".config/usb-redirector/filter.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.filter.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.filter.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.filter.root_hub_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(anyhow!("At least one root hub id is required"));
        }

        for rule in &self.policy.rules {
            Self::validate_filter(&rule.device_filter)
                .with_context(|| format!("Invalid rule for '{}'", rule.device_filter))?;
            if rule.instance_prefix.as_deref() == Some("") {
                return Err(anyhow!(
                    "Empty instance_prefix in rule '{}'",
                    rule.device_filter
                ));
            }
        }

        if self.host.poll_interval_ms == 0 {
            return Err(anyhow!("host.poll_interval_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<FilterConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    FilterConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FilterConfig::default();
        assert_eq!(config.filter.log_level, "info");
        assert_eq!(config.filter.root_hub_ids.len(), 2);
        assert_eq!(config.policy.default_action, RedirectAction::Native);
        assert!(config.policy.rules.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(FilterConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(FilterConfig::validate_filter("0x1234:*").is_ok());
        assert!(FilterConfig::validate_filter("*:0x5678").is_ok());
        assert!(FilterConfig::validate_filter("*:*").is_ok());
        assert!(FilterConfig::validate_filter("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(FilterConfig::validate_filter("1234:5678").is_err());
        assert!(FilterConfig::validate_filter("0x1234").is_err());
        assert!(FilterConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(FilterConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(FilterConfig::validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_validate_rules() {
        let mut config = FilterConfig::default();
        config.policy.rules.push(RedirectRule {
            device_filter: "0x1234:*".to_string(),
            instance_prefix: None,
            action: RedirectAction::Redirect,
            description: None,
        });
        assert!(config.validate().is_ok());

        config.policy.rules[0].instance_prefix = Some(String::new());
        assert!(config.validate().is_err());

        config.policy.rules[0].instance_prefix = None;
        config.policy.rules[0].device_filter = "1234".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level_and_interval() {
        let mut config = FilterConfig::default();
        config.filter.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.filter.log_level = "debug".to_string();
        config.host.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = FilterConfig::default();
        config.policy.default_action = RedirectAction::Redirect;
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FilterConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.filter.log_level, parsed.filter.log_level);
        assert_eq!(config.policy, parsed.policy);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: FilterConfig = toml::from_str(
            r#"
            [[policy.rules]]
            filter = "0x046d:*"
            action = "redirect"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.filter.log_level, "info");
        assert_eq!(parsed.host.poll_interval_ms, 1000);
        assert_eq!(parsed.policy.rules[0].device_filter, "0x046d:*");
        assert_eq!(parsed.policy.rules[0].action, RedirectAction::Redirect);
    }
}
