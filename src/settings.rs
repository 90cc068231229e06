//! User options, read from `openhedz.json` next to the game executable.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// The name of the options file.
const FILE_NAME: &str = "openhedz.json";

fn default_log_file() -> PathBuf {
    PathBuf::from("openhedz.log")
}

fn default_level() -> log::LevelFilter {
    log::LevelFilter::Trace
}

fn yes() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Options {
    /// Where the log is written. Relative paths are resolved against the game directory.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Mirror log output to the console.
    #[serde(default = "yes")]
    pub console: bool,

    /// Prefix each log line with the local time.
    #[serde(default)]
    pub timestamp: bool,

    /// The most verbose level that is logged.
    #[serde(default = "default_level")]
    pub level: log::LevelFilter,

    /// Whether the hooks get installed at all. Turning this off leaves the game untouched.
    #[serde(default = "yes")]
    pub install_hooks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            log_file: default_log_file(),
            console: true,
            timestamp: false,
            level: default_level(),
            install_hooks: true,
        }
    }
}

/// Returns the directory containing the game executable, or the working directory if that can't
/// be found.
fn game_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Options {
    /// Parses options from JSON. Missing keys take their default values.
    pub fn load_from(reader: impl Read) -> Result<Options> {
        serde_json::from_reader(reader).wrap_err("malformed options file")
    }

    /// Returns the path of the options file.
    pub fn path() -> PathBuf {
        game_dir().join(FILE_NAME)
    }

    /// Loads the options file if it exists. A missing file is not an error.
    fn load_file(path: &Path) -> Result<Option<Options>> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path).wrap_err("failed to open options file")?;
        Options::load_from(file).map(Some)
    }

    /// Loads the options, falling back to defaults. Logging isn't running yet when this is
    /// called, so any error is handed back alongside the defaults for the caller to report once
    /// it is.
    pub fn load() -> (Options, Option<eyre::Report>) {
        match Options::load_file(&Options::path()) {
            Ok(Some(options)) => (options, None),
            Ok(None) => (Options::default(), None),
            Err(err) => (Options::default(), Some(err)),
        }
    }

    /// The absolute path of the log file.
    pub fn log_path(&self) -> PathBuf {
        if self.log_file.is_absolute() {
            self.log_file.clone()
        } else {
            game_dir().join(&self.log_file)
        }
    }
}
