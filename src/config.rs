use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::{LogFormat, LogLevel};
use crate::supervisor::BuildCommand;

/// Settings read from the optional JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Build tool program, resolved through `PATH` when not absolute.
    pub build_tool: String,
    /// Arguments passed to the build tool before each request's arguments.
    pub build_tool_args: Vec<String>,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build_tool: "make".to_string(),
            build_tool_args: Vec::new(),
            log_format: LogFormat::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// `<config dir>/build-supervisor/config.json`, if the platform has a
    /// config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("build-supervisor").join("config.json"))
    }

    /// Load `path`, or the default location when `path` is `None`.
    ///
    /// A missing default file yields the defaults; an explicitly named file
    /// must exist and parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| Error::Config(format!("invalid config: {err}")))
    }

    pub fn build_command(&self) -> BuildCommand {
        BuildCommand::new(&self.build_tool).with_leading_args(self.build_tool_args.iter().cloned())
    }
}
