use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fmt, fs, path};

use scorecheck::{CheckError, ProberSettings, ScoreTable, ServiceKind, ServiceScore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config {path}: {source}")]
    ReadFailed { path: PathBuf, source: std::io::Error },

    #[error("Failed to write config {path}: {source}")]
    WriteFailed { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("Invalid scoring override: {0}")]
    InvalidScoring(#[from] CheckError),

    #[error("No config directory: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: Engine,
    pub logging: Logging,
    pub ssh: Ssh,
    pub ftp: Ftp,
    pub database: Database,
    /// Per-service `(pass, warn)` overrides keyed by service name
    pub scoring: BTreeMap<String, ServiceScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub interval_seconds: u64,
    /// Unbounded when absent
    pub max_concurrency: Option<usize>,
    pub roster: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ssh {
    /// Where non-inline private keys are looked up. Home directory when absent.
    pub key_dir: Option<PathBuf>,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ftp {
    pub staging_dir: PathBuf,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            interval_seconds: scorecheck::CYCLE_INTERVAL.as_secs(),
            max_concurrency: None,
            roster: PathBuf::from("roster.toml"),
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl Default for Ssh {
    fn default() -> Self {
        Self { key_dir: None, connect_timeout_seconds: 5 }
    }
}

impl Default for Ftp {
    fn default() -> Self {
        Self { staging_dir: PathBuf::from("ftp_staging"), connect_timeout_seconds: 5 }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self { enabled: false, path: PathBuf::from("scorecheck.db") }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/scorecheck/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("scorecheck/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let unset = |value: Option<String>| value.unwrap_or_else(|| "unset".into());

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Engine")?;
        write_1(f, "Interval (s)", &self.engine.interval_seconds)?;
        write_1(f, "Max Concurrency", &unset(self.engine.max_concurrency.map(|n| n.to_string())))?;
        write_1(f, "Roster", &self.engine.roster.display())?;
        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        write_title_1(f, "SSH")?;
        write_1(f, "Key Directory", &self.key_dir().display())?;
        write_1(f, "Connect Timeout (s)", &self.ssh.connect_timeout_seconds)?;
        write_title_1(f, "FTP")?;
        write_1(f, "Staging Directory", &self.ftp.staging_dir.display())?;
        write_1(f, "Connect Timeout (s)", &self.ftp.connect_timeout_seconds)?;
        write_title_1(f, "Database")?;
        write_1(f, "Enabled", &self.database.enabled)?;
        write_1(f, "Path", &self.database.path.display())?;
        if !self.scoring.is_empty() {
            write_title_1(f, "Scoring Overrides")?;
            for (service, score) in &self.scoring {
                write_1(f, service, &format!("pass {} / warn {}", score.pass, score.warn))?;
            }
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/scorecheck/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;
        let write_failed = |source| Error::WriteFailed { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }

        fs::write(path, config_str).map_err(write_failed)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.engine.interval_seconds)
    }

    pub fn key_dir(&self) -> PathBuf {
        self.ssh
            .key_dir
            .clone()
            .or_else(env::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn prober_settings(&self) -> ProberSettings {
        ProberSettings {
            key_dir: self.key_dir(),
            staging_dir: self.ftp.staging_dir.clone(),
            ssh_timeout: Duration::from_secs(self.ssh.connect_timeout_seconds),
            ftp_timeout: Duration::from_secs(self.ftp.connect_timeout_seconds),
        }
    }

    /// Default table with the `[scoring]` overrides applied
    pub fn score_table(&self) -> Result<ScoreTable, Error> {
        let mut table = ScoreTable::default();
        for (service, score) in &self.scoring {
            table.set(service.parse::<ServiceKind>()?, *score);
        }
        Ok(table)
    }
}
