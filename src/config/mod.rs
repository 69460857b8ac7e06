mod basic;
mod connector;
pub mod secrets;

pub use basic::BasicConfig;
pub use connector::{ConfigSource, ConnectorConfig, PeerTarget, ValidatedDataModel};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Process configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core settings (see `basic` table in tether.toml).
    #[serde(default)]
    pub basic: BasicConfig,
}

const DEFAULT_CONFIG_FILE: &str = "tether.toml";
const ENV_PREFIX: &str = "TETHER_";

impl Config {
    /// Builds a Figment that merges defaults, `tether.toml` and `TETHER_*` environment variables.
    ///
    /// Nested keys use a double underscore: `TETHER_BASIC__LOGLEVEL=debug`.
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads configuration; startup aborts on malformed settings.
    pub fn load() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional {DEFAULT_CONFIG_FILE} + env): {err}")
        })
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::load);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_files() {
        let cfg: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .extract()
            .expect("defaults extract");
        assert_eq!(cfg.basic.loglevel, "info");
        assert_eq!(cfg.basic.config_path, PathBuf::from("config.json"));
        assert_eq!(cfg.basic.directory_cache_ttl_secs, 600);
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                "[basic]\nloglevel = \"debug\"\nconfig_path = \"/etc/tether/config.json\"\n",
            ))
            .extract()
            .expect("toml extract");
        assert_eq!(cfg.basic.loglevel, "debug");
        assert_eq!(cfg.basic.config_path, PathBuf::from("/etc/tether/config.json"));
        assert_eq!(cfg.basic.install_dir, PathBuf::from("."));
    }
}
