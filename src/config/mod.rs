use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flapping::DEFAULT_CHECK_DELAY;
use crate::show::ShowOptions;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ringmaster";

fn default_controller_endpoint() -> String {
    "127.0.0.1:5555".to_string()
}

fn default_controller_timeout_millis() -> u64 {
    1000
}

fn default_pubsub_endpoint() -> String {
    "127.0.0.1:5556".to_string()
}

fn default_flapping_enabled() -> bool {
    true
}

fn default_check_delay_secs() -> f64 {
    DEFAULT_CHECK_DELAY.as_secs_f64()
}

fn default_call_timeout_secs() -> f64 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_controller_endpoint")]
    pub endpoint: String,
    /// Longest a single poll waits before the loop rechecks its stop flag.
    #[serde(default = "default_controller_timeout_millis")]
    pub timeout_millis: u64,
}

impl ControllerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            endpoint: default_controller_endpoint(),
            timeout_millis: default_controller_timeout_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubSettings {
    #[serde(default = "default_pubsub_endpoint")]
    pub endpoint: String,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            endpoint: default_pubsub_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlappingSettings {
    #[serde(default = "default_flapping_enabled")]
    pub enabled: bool,
    /// Seconds subtracted from every measured burst span.
    #[serde(default = "default_check_delay_secs")]
    pub check_delay_secs: f64,
    /// Read/write timeout for the detector's calls into the controller. Must
    /// outlast every show's `graceful_timeout`, since `stop_show` replies only
    /// once the workers are gone. Zero waits forever.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: f64,
    /// JSON-lines audit log of flapping decisions.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl FlappingSettings {
    pub fn check_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.check_delay_secs).unwrap_or(DEFAULT_CHECK_DELAY)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.call_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

impl Default for FlappingSettings {
    fn default() -> Self {
        Self {
            enabled: default_flapping_enabled(),
            check_delay_secs: default_check_delay_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            audit_log: None,
        }
    }
}

/// One `[[show]]` entry.
///
/// ```toml
/// [[show]]
/// name = "web"
/// cmd = "python -m http.server"
/// numprocesses = 2
/// times = 3
/// within = 5.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowConfig {
    pub name: String,
    #[serde(flatten)]
    pub options: ShowOptions,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub pubsub: PubSubSettings,
    #[serde(default)]
    pub flapping: FlappingSettings,
    #[serde(default, rename = "show")]
    pub shows: Vec<ShowConfig>,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.ringmaster/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let config = Self::load_file(&path)?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    /// Load and validate an explicit config file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: ProjectConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for show in &self.shows {
            let name = show.name.to_lowercase();
            if name.trim().is_empty() || name.contains(char::is_whitespace) {
                bail!("show name {:?} must be a single non-empty word", show.name);
            }
            if !seen.insert(name) {
                bail!("show {:?} is defined more than once", show.name);
            }
            if show.options.cmd.trim().is_empty() {
                bail!("show {:?} has an empty cmd", show.name);
            }
            if show.options.times == 0 {
                bail!("show {:?}: times must be at least 1", show.name);
            }
            let seconds = [
                ("within", show.options.within),
                ("retry_in", show.options.retry_in),
                ("graceful_timeout", show.options.graceful_timeout),
                ("warmup_delay", show.options.warmup_delay),
            ];
            for (key, value) in seconds {
                if !non_negative(value) {
                    bail!("show {:?}: {key} must be a non-negative number", show.name);
                }
            }
        }
        if !non_negative(self.flapping.check_delay_secs) {
            bail!("flapping.check_delay_secs must be a non-negative number");
        }
        if !non_negative(self.flapping.call_timeout_secs) {
            bail!("flapping.call_timeout_secs must be a non-negative number");
        }
        let call_timeout = self.flapping.call_timeout_secs;
        if self.flapping.enabled && call_timeout > 0.0 {
            if let Some(show) = self
                .shows
                .iter()
                .find(|show| show.options.graceful_timeout >= call_timeout)
            {
                bail!(
                    "flapping.call_timeout_secs ({call_timeout}) must exceed the graceful_timeout ({}) of show {:?}",
                    show.options.graceful_timeout,
                    show.name
                );
            }
        }
        Ok(())
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

fn non_negative(seconds: f64) -> bool {
    seconds.is_finite() && seconds >= 0.0
}
