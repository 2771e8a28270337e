use super::types::*;
use crate::analysis::registry::ModuleRegistry;
use crate::analysis::runner::RunnerConfig;
use crate::data_capture::types::CaptureSettings;
use crate::decoder::types::LinkType;
use crate::error_handling::types::ConfigError;
use crate::storage::rotator::RotatorConfig;
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const MIN_SNAPLEN: u32 = 64;
pub const MAX_SNAPLEN: u32 = 65535;

/// Runtime configuration, read from a TOML file.
///
/// Every section and field is optional and falls back to its default, so an
/// empty file yields a capture on `eth0` into `./captures`.
///
/// ```toml
/// [capture]
/// interface = "eth0"
/// filter = "tcp port 443"
/// snaplen = 1518
/// buffer_profile = "fast"
///
/// [storage]
/// output_root = "/var/lib/sniff"
/// retention_days = 7
///
/// [analysis]
/// modules = ["protocol_stats"]
/// workers = 2
///
/// [live_feed]
/// enabled = true
/// bind_address = "127.0.0.1:8080"
/// ```
///
/// `validate` must succeed before the pipeline starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureSection,
    pub storage: StorageSection,
    pub analysis: AnalysisSection,
    pub daemon: DaemonSection,
    pub live_feed: LiveFeedSection,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    /// Command-line overrides of the capture section.
    pub fn apply_overrides(&mut self, interface: Option<String>, filter: Option<String>) {
        if let Some(interface) = interface {
            debug!("Interface overridden to {}", interface);
            self.capture.interface = interface;
        }
        if let Some(filter) = filter {
            debug!("Filter overridden to {:?}", filter);
            self.capture.filter = Some(filter);
        }
    }

    /// The filter, with blank expressions treated as none.
    pub fn filter(&self) -> Option<&str> {
        self.capture
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }

    /// Checks everything that can be checked without opening the interface.
    pub fn validate(&self, registry: &ModuleRegistry) -> Result<(), ConfigError> {
        validate_interface_name(&self.capture.interface)?;
        if !(MIN_SNAPLEN..=MAX_SNAPLEN).contains(&self.capture.snaplen) {
            return Err(ConfigError::NotInRange(format!(
                "snaplen {} outside {}..={}",
                self.capture.snaplen, MIN_SNAPLEN, MAX_SNAPLEN
            )));
        }
        if self.capture.queue_capacity == Some(0) {
            return Err(ConfigError::NotInRange("queue_capacity must be at least 1".into()));
        }
        if self.capture.stats_interval_secs == 0 {
            return Err(ConfigError::NotInRange("stats_interval_secs must be at least 1".into()));
        }
        if let Some(filter) = self.filter() {
            validate_filter(filter)?;
        }
        validate_output_root(&self.storage.output_root)?;
        if self.analysis.workers == 0 {
            return Err(ConfigError::NotInRange("analysis workers must be at least 1".into()));
        }
        if self.analysis.module_timeout_secs == 0 {
            return Err(ConfigError::NotInRange("module_timeout_secs must be at least 1".into()));
        }
        if let Some(modules) = &self.analysis.modules {
            for name in modules {
                if !registry.contains(name) {
                    return Err(ConfigError::UnknownModule(name.clone()));
                }
            }
        }
        if self.live_feed.enabled {
            if self.live_feed.socket_addr().is_none() {
                return Err(ConfigError::NotInRange(format!(
                    "live_feed bind_address {:?} is not a socket address",
                    self.live_feed.bind_address
                )));
            }
            if self.live_feed.cache_size == 0 {
                return Err(ConfigError::NotInRange("live_feed cache_size must be at least 1".into()));
            }
        }
        debug!("Configuration validated");
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        let mut settings = CaptureSettings::new(self.capture.interface.clone());
        settings.filter = self.filter().map(str::to_string);
        settings.snaplen = self.capture.snaplen;
        settings.promiscuous = self.capture.promiscuous;
        settings.profile = self.capture.buffer_profile;
        settings.queue_capacity = self.capture.queue_capacity;
        settings.stats_interval = Duration::from_secs(self.capture.stats_interval_secs.max(1));
        settings
    }

    pub fn rotator_config(&self, link_type: LinkType) -> RotatorConfig {
        RotatorConfig {
            root: self.storage.output_root.clone(),
            interface: self.capture.interface.clone(),
            snaplen: self.capture.snaplen,
            link_type,
            retention_days: self.storage.retention_days,
            zone: self.storage.time_zone,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            root: self.storage.output_root.clone(),
            workers: self.analysis.workers,
            timeout: Duration::from_secs(self.analysis.module_timeout_secs),
            enabled: self.analysis.modules.clone(),
        }
    }
}

fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:@-]{0,14}$")
        .map_err(|e| ConfigError::InvalidInterface(e.to_string()))?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidInterface(name.to_string()))
    }
}

#[cfg(feature = "live-capture")]
fn validate_filter(filter: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidFilter {
        filter: filter.to_string(),
        reason,
    };
    let dead = pcap::Capture::dead(pcap::Linktype::ETHERNET).map_err(|e| invalid(e.to_string()))?;
    dead.compile(filter, true).map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

/// Without libpcap only obviously broken expressions are caught here.
#[cfg(not(feature = "live-capture"))]
fn validate_filter(filter: &str) -> Result<(), ConfigError> {
    let mut depth = 0i32;
    for c in filter.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            break;
        }
    }
    if depth != 0 {
        return Err(ConfigError::InvalidFilter {
            filter: filter.to_string(),
            reason: "unbalanced parentheses".into(),
        });
    }
    Ok(())
}

fn validate_output_root(root: &Path) -> Result<(), ConfigError> {
    if root.as_os_str().is_empty() {
        return Err(ConfigError::InvalidOutputPath("output_root is empty".into()));
    }
    if root.exists() {
        if !root.is_dir() {
            return Err(ConfigError::InvalidOutputPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let readonly = fs::metadata(root)
            .map(|m| m.permissions().readonly())
            .unwrap_or(true);
        if readonly {
            return Err(ConfigError::InvalidOutputPath(format!(
                "{} is not writable",
                root.display()
            )));
        }
        return Ok(());
    }
    // A missing root is fine as long as its nearest existing ancestor is a directory.
    let mut ancestor = root.parent();
    while let Some(dir) = ancestor {
        if dir.as_os_str().is_empty() || dir.exists() {
            if dir.as_os_str().is_empty() || dir.is_dir() {
                return Ok(());
            }
            return Err(ConfigError::InvalidOutputPath(format!(
                "{} cannot be created under {}",
                root.display(),
                dir.display()
            )));
        }
        ancestor = dir.parent();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_capture::types::BufferProfile;
    use crate::storage::time_window::WindowZone;
    use tempfile::TempDir;

    fn valid(root: &Path) -> Config {
        let mut config = Config::default();
        config.storage.output_root = root.join("captures");
        config
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.capture.snaplen, 1518);
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.analysis.workers, 2);
        assert_eq!(config.analysis.module_timeout_secs, 300);
        assert_eq!(config.live_feed.cache_size, 5000);
        assert!(!config.live_feed.enabled);
        assert_eq!(config.daemon.pid_file, Path::new("/tmp/sniff.pid"));
    }

    #[test]
    fn parses_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sniff.toml");
        fs::write(
            &path,
            r#"
            [capture]
            interface = "wlan0"
            filter = "tcp port 443"
            snaplen = 256
            buffer_profile = "fast"

            [storage]
            output_root = "/var/lib/sniff"
            retention_days = 30
            time_zone = "utc"

            [analysis]
            modules = ["protocol_stats"]
            workers = 4

            [live_feed]
            enabled = true
            bind_address = "0.0.0.0:9000"
            "#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.capture.interface, "wlan0");
        assert_eq!(config.capture.buffer_profile, BufferProfile::Fast);
        assert_eq!(config.storage.time_zone, WindowZone::Utc);
        assert_eq!(config.analysis.workers, 4);
        assert_eq!(config.analysis.module_timeout_secs, 300);

        let settings = config.capture_settings();
        assert_eq!(settings.snaplen, 256);
        assert_eq!(settings.queue_capacity(), 20_000);
        assert_eq!(settings.filter.as_deref(), Some("tcp port 443"));
    }

    #[test]
    fn malformed_toml_is_configuration_error() {
        let err = Config::from_toml_str("[capture\ninterface=").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let tmp = TempDir::new().unwrap();
        let registry = ModuleRegistry::with_builtins();
        assert!(valid(tmp.path()).validate(&registry).is_ok());

        let mut c = valid(tmp.path());
        c.capture.interface = "eth0; rm -rf /".into();
        assert!(matches!(c.validate(&registry), Err(ConfigError::InvalidInterface(_))));

        let mut c = valid(tmp.path());
        c.capture.snaplen = 10;
        assert!(matches!(c.validate(&registry), Err(ConfigError::NotInRange(_))));

        let mut c = valid(tmp.path());
        c.analysis.workers = 0;
        assert!(matches!(c.validate(&registry), Err(ConfigError::NotInRange(_))));

        let mut c = valid(tmp.path());
        c.analysis.modules = Some(vec!["nope".into()]);
        assert!(matches!(c.validate(&registry), Err(ConfigError::UnknownModule(_))));

        let mut c = valid(tmp.path());
        c.live_feed.enabled = true;
        c.live_feed.bind_address = "localhost".into();
        assert!(matches!(c.validate(&registry), Err(ConfigError::NotInRange(_))));

        let mut c = valid(tmp.path());
        c.capture.filter = Some("tcp and (port 80".into());
        assert!(matches!(c.validate(&registry), Err(ConfigError::InvalidFilter { .. })));
    }

    #[test]
    fn output_root_must_be_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        let registry = ModuleRegistry::with_builtins();

        let mut c = Config::default();
        c.storage.output_root = file.clone();
        assert!(matches!(c.validate(&registry), Err(ConfigError::InvalidOutputPath(_))));

        c.storage.output_root = file.join("below");
        assert!(matches!(c.validate(&registry), Err(ConfigError::InvalidOutputPath(_))));
    }

    #[test]
    fn overrides_and_blank_filter() {
        let mut c = Config::default();
        c.capture.filter = Some("   ".into());
        assert_eq!(c.filter(), None);
        c.apply_overrides(Some("lo".into()), Some("udp".into()));
        assert_eq!(c.capture.interface, "lo");
        assert_eq!(c.filter(), Some("udp"));
    }
}
