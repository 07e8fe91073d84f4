//! Directory layout for labctl.
//!
//! - Config: `$XDG_CONFIG_HOME/labctl/` or `~/.config/labctl/`
//! - Logs:   `$XDG_STATE_HOME/labctl/logs/` or `~/.local/state/labctl/logs/`

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "labctl";
const CONFIG_FILE: &str = "labctl.toml";

#[derive(Debug, Clone)]
pub struct LabPaths {
    pub config: PathBuf,
    pub logs: PathBuf,
}

impl LabPaths {
    /// Resolve from the environment. Does not create anything; call
    /// [`ensure`](Self::ensure) for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(&home))
    }

    fn under(home: &Path) -> Self {
        let config = match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg) => PathBuf::from(xdg).join(APP_NAME),
            Err(_) => home.join(".config").join(APP_NAME),
        };
        let state = match std::env::var("XDG_STATE_HOME") {
            Ok(xdg) => PathBuf::from(xdg).join(APP_NAME),
            Err(_) => home.join(".local").join("state").join(APP_NAME),
        };
        Self {
            config,
            logs: state.join("logs"),
        }
    }

    /// `labctl.toml` inside the config directory.
    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!(dir = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_app_name() {
        let paths = LabPaths::under(Path::new("/home/lab"));
        assert!(paths.config.ends_with("labctl"));
        assert!(paths.logs.ends_with("labctl/logs"));
        assert!(paths.config_file().ends_with("labctl/labctl.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = LabPaths {
            config: tmp.path().join("config"),
            logs: tmp.path().join("state/logs"),
        };

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.logs.is_dir());
    }
}
