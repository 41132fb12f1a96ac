/// Configuration module for the Detector orchestrator
///
/// Every section is loaded from environment variables (after reading an
/// optional `.env` file), defaulted field by field and validated once at
/// load time. Machine-manager backend options live in a separate INI file
/// per backend, see [`Config::machinery_conf_path`].

use anyhow::{Context, Result};
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shared::observability::{LogConfig, LogFormat, LogLevel};

/// Main configuration structure for the orchestrator
#[derive(Debug, Clone)]
pub struct Config {
    pub detector: DetectorConfig,
    pub resultserver: ResultServerConfig,
    pub database: DatabaseConfig,
    pub timeouts: TimeoutsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let detector = DetectorConfig::from_env()?;
        let database = DatabaseConfig::from_env(&detector.root)?;

        let config = Self {
            detector,
            resultserver: ResultServerConfig::from_env()?,
            database,
            timeouts: TimeoutsConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.resultserver.validate()?;
        self.database.validate()?;
        self.timeouts.validate()?;
        Ok(())
    }

    /// Path of the INI file holding the selected backend's options.
    pub fn machinery_conf_path(&self) -> PathBuf {
        self.detector
            .root
            .join("conf")
            .join(format!("{}.conf", self.detector.machinery))
    }

    /// Base directory holding one storage tree per task.
    pub fn analyses_path(&self) -> PathBuf {
        self.detector.root.join("storage").join("analyses")
    }
}

impl Default for Config {
    fn default() -> Self {
        let detector = DetectorConfig::default();
        let database = DatabaseConfig::for_root(&detector.root);
        Self {
            detector,
            resultserver: ResultServerConfig::default(),
            database,
            timeouts: TimeoutsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

/// Scheduler and machine pool limits
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub root: PathBuf,
    pub machinery: String,
    /// Machines allowed to be starting at once. 0 means a binary lock.
    pub max_vmstartup_count: usize,
    /// Free disk space floor in MB. 0 disables the check.
    pub freespace_mb: u64,
    /// Concurrently running machines. 0 means unlimited.
    pub max_machines_count: usize,
    /// Total analyses before the scheduler exits. 0 means unlimited.
    pub max_analysis_count: u64,
    pub process_results: bool,
}

impl DetectorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            root: PathBuf::from(env::var("DETECTOR_ROOT").unwrap_or_else(|_| ".".to_string())),
            machinery: env::var("DETECTOR_MACHINERY").unwrap_or_else(|_| "virtualbox".to_string()),
            max_vmstartup_count: parse_var("MAX_VMSTARTUP_COUNT", "0")?,
            freespace_mb: parse_var("FREESPACE_MB", "1024")?,
            max_machines_count: parse_var("MAX_MACHINES_COUNT", "0")?,
            max_analysis_count: parse_var("MAX_ANALYSIS_COUNT", "0")?,
            process_results: parse_var("PROCESS_RESULTS", "true")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.machinery.trim().is_empty() {
            anyhow::bail!("Machine manager name cannot be empty");
        }
        Ok(())
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            machinery: "virtualbox".to_string(),
            max_vmstartup_count: 0,
            freespace_mb: 1024,
            max_machines_count: 0,
            max_analysis_count: 0,
            process_results: true,
        }
    }
}

/// Result server listener configuration
#[derive(Debug, Clone)]
pub struct ResultServerConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// How many successive ports to try when the address is in use.
    pub port_retries: u16,
    /// Cap on bytes stored per process log.
    pub upload_max_bytes: u64,
}

impl ResultServerConfig {
    pub fn from_env() -> Result<Self> {
        let upload_max_mb: u64 = parse_var("RESULTSERVER_UPLOAD_MAX_MB", "128")?;
        Ok(Self {
            ip: parse_var("RESULTSERVER_IP", "192.168.56.1")?,
            port: parse_var("RESULTSERVER_PORT", "2042")?,
            port_retries: parse_var("RESULTSERVER_PORT_RETRIES", "32")?,
            upload_max_bytes: mebibytes(upload_max_mb)
                .with_context(|| format!("Invalid RESULTSERVER_UPLOAD_MAX_MB: {}", upload_max_mb))?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Result server port cannot be 0");
        }
        if self.port_retries == 0 {
            anyhow::bail!("Result server port retry budget must be at least 1");
        }
        Ok(())
    }
}

impl Default for ResultServerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::from([192, 168, 56, 1]),
            port: 2042,
            port_retries: 32,
            upload_max_bytes: 128 * 1024 * 1024,
        }
    }
}

fn mebibytes(mb: u64) -> Option<u64> {
    mb.checked_mul(1024 * 1024)
}

/// Task store configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env(root: &Path) -> Result<Self> {
        let defaults = Self::for_root(root);
        Ok(Self {
            url: env::var("DATABASE_URL").unwrap_or(defaults.url),
            max_connections: parse_var("DB_MAX_CONNECTIONS", "5")?,
        })
    }

    /// Default sqlite database under `<root>/db`.
    pub fn for_root(root: &Path) -> Self {
        Self {
            url: format!("sqlite://{}?mode=rwc", root.join("db").join("detector.db").display()),
            max_connections: 5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.max_connections == 0 {
            anyhow::bail!("Database max connections must be at least 1");
        }
        Ok(())
    }
}

/// Analysis and machine state timeouts
#[derive(Debug, Clone)]
pub struct TimeoutsConfig {
    pub default: Duration,
    pub critical: Duration,
    pub vm_state: Duration,
}

impl TimeoutsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            default: Duration::from_secs(parse_var("TIMEOUT_DEFAULT", "120")?),
            critical: Duration::from_secs(parse_var("TIMEOUT_CRITICAL", "60")?),
            vm_state: Duration::from_secs(parse_var("TIMEOUT_VM_STATE", "60")?),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.default.is_zero() {
            anyhow::bail!("Default analysis timeout must be greater than 0");
        }
        Ok(())
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(120),
            critical: Duration::from_secs(60),
            vm_state: Duration::from_secs(60),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            level: parse_var("LOG_LEVEL", "info")?,
            format: parse_var("LOG_FORMAT", "pretty")?,
        })
    }

    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            format: self.format,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();
        assert_eq!(config.resultserver.port, 2042);
        assert_eq!(config.detector.machinery, "virtualbox");
        assert_eq!(config.detector.max_vmstartup_count, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_machinery_conf_path() {
        let mut config = Config::default();
        config.detector.root = PathBuf::from("/opt/detector");
        config.detector.machinery = "physical".to_string();
        assert_eq!(
            config.machinery_conf_path(),
            PathBuf::from("/opt/detector/conf/physical.conf")
        );
        assert_eq!(
            config.analyses_path(),
            PathBuf::from("/opt/detector/storage/analyses")
        );
    }

    #[test]
    fn test_resultserver_config_validation() {
        let mut config = ResultServerConfig::default();
        assert!(config.validate().is_ok());

        config.port = 0;
        assert!(config.validate().is_err());

        config.port = 2042;
        config.port_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_cap_overflow_is_rejected() {
        assert_eq!(mebibytes(128), Some(128 * 1024 * 1024));
        assert_eq!(mebibytes(0), Some(0));
        assert_eq!(mebibytes(u64::MAX / 1024), None);
    }

    #[test]
    fn test_database_config_validation() {
        let mut config = DatabaseConfig::for_root(Path::new("/srv"));
        assert!(config.url.starts_with("sqlite:///srv/db/detector.db"));
        assert!(config.validate().is_ok());

        config.max_connections = 0;
        assert!(config.validate().is_err());

        config.max_connections = 1;
        config.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detector_config_validation() {
        let mut config = DetectorConfig::default();
        config.machinery = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_validation() {
        let mut config = TimeoutsConfig::default();
        assert!(config.validate().is_ok());
        config.default = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
