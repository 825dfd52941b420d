//! Configuration loading.
//!
//! One configuration root, located through the XDG base directory search
//! unless given on the command line, holding `core.toml` with the three
//! recognised keys plus one optional `plugin_<name>.toml` per plugin.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Name of the core configuration file inside the configuration root.
pub const CONFIG_FILENAME: &str = "core.toml";

/// The core configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Whether to wait for DRM vertical blanks before the backend swaps.
    #[serde(default, rename = "vsync-drm")]
    pub vsync_drm: bool,
    /// Name of the rendering backend to load.
    #[serde(default = "default_rendering")]
    pub rendering: String,
    /// Plugin names in activation order.
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vsync_drm: false,
            rendering: default_rendering(),
            plugins: Vec::new(),
        }
    }
}

fn default_rendering() -> String {
    "render".to_owned()
}

/// A configuration loading failure, fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot find configuration directory")]
    NotFound,

    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Loads `core.toml` from `explicit_dir` or the first XDG configuration
    /// directory containing it. Returns the configuration and the directory
    /// it came from, which is reused for plugin configuration files.
    pub fn load(explicit_dir: Option<&Path>) -> Result<(Config, PathBuf), ConfigError> {
        let dir = match explicit_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_config_dir()?,
        };
        let path = dir.join(CONFIG_FILENAME);
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&contents).map_err(|source| ConfigError::Parse { path, source })?;
        Ok((config, dir))
    }

    /// Parses the contents of a `core.toml`.
    pub fn parse(contents: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Path of the configuration file of plugin `name`, a sibling of the
    /// core file.
    pub fn plugin_config_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("plugin_{}.toml", name))
    }
}

fn default_config_dir() -> Result<PathBuf, ConfigError> {
    let xdg = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME")).map_err(|_| ConfigError::NotFound)?;
    xdg.find_config_file(CONFIG_FILENAME)
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .ok_or(ConfigError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_keys() {
        let config = Config::parse(
            r#"
            vsync-drm = true
            rendering = "render"
            plugins = ["expose", "opacity"]
            "#,
        )
        .unwrap();
        assert!(config.vsync_drm);
        assert_eq!(config.rendering, "render");
        assert_eq!(config.plugins, vec!["expose", "opacity"]);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = Config::parse("").unwrap();
        assert!(!config.vsync_drm);
        assert_eq!(config.rendering, "render");
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("no-such-key = 1").is_err());
    }

    #[test]
    fn invalid_toml_is_rejected() {
        assert!(Config::parse("plugins = [").is_err());
    }

    #[test]
    fn plugin_config_paths_are_siblings() {
        let path = Config::plugin_config_path(Path::new("/etc/xdg/lucarne"), "expose");
        assert_eq!(path, Path::new("/etc/xdg/lucarne/plugin_expose.toml"));
    }
}
