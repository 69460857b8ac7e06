use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Basic (process-level) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// Log level for tracing subscriber initialization (e.g., "error", "warn", "info", "debug", "trace").
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Path of the connector configuration document, relative to the working directory.
    /// TOML: `basic.config_path`. Default: `config.json`.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Installation directory; code archives unpack here and scripts resolve against it.
    /// TOML: `basic.install_dir`. Default: `.`.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Script launched, detached, to restart the process.
    /// TOML: `basic.restart_script`. Default: `restart.sh` (`restart.bat` on Windows).
    #[serde(default = "default_restart_script")]
    pub restart_script: PathBuf,

    /// Script run after a code archive has been unpacked.
    /// TOML: `basic.update_script`. Default: `update.sh` (`update.bat` on Windows).
    #[serde(default = "default_update_script")]
    pub update_script: PathBuf,

    /// Directory service that maps user names to server URLs.
    /// TOML: `basic.directory_url`. Default: `https://console.instantdevelopercloud.com/CCC/`.
    #[serde(default = "default_directory_url")]
    pub directory_url: Url,

    /// How long a resolved user name stays cached.
    /// TOML: `basic.directory_cache_ttl_secs`. Default: `600`.
    #[serde(default = "default_directory_cache_ttl_secs")]
    pub directory_cache_ttl_secs: u64,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            config_path: default_config_path(),
            install_dir: default_install_dir(),
            restart_script: default_restart_script(),
            update_script: default_update_script(),
            directory_url: default_directory_url(),
            directory_cache_ttl_secs: default_directory_cache_ttl_secs(),
        }
    }
}

impl BasicConfig {
    /// Resolves `path` against the installation directory unless it is absolute.
    pub fn install_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.install_dir.join(path)
        }
    }
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("config.json")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_restart_script() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("restart.bat")
    } else {
        PathBuf::from("restart.sh")
    }
}

fn default_update_script() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("update.bat")
    } else {
        PathBuf::from("update.sh")
    }
}

fn default_directory_url() -> Url {
    Url::parse("https://console.instantdevelopercloud.com/CCC/")
        .unwrap_or_else(|err| panic!("built-in directory url is invalid: {err}"))
}

fn default_directory_cache_ttl_secs() -> u64 {
    600
}
