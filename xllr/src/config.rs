use std::env;
use std::path::PathBuf;

use crate::XllrError;

pub const HOME_VAR: &str = "XLLR_HOME";
pub const PLUGIN_PATH_VAR: &str = "XLLR_PLUGIN_PATH";
pub const DEFAULT_LIBRARY_PREFIX: &str = "xllr.";

#[derive(Debug, Clone)]
pub struct XllrCreateInfo {
    /// Searched in order for native runtime plugins.
    pub plugin_dirs: Vec<PathBuf>,
    // file name is `<prefix><name><dll suffix>`, e.g. `xllr.python3.so`
    pub library_prefix: String,
}

impl Default for XllrCreateInfo {
    fn default() -> Self {
        Self {
            plugin_dirs: Vec::new(),
            library_prefix: DEFAULT_LIBRARY_PREFIX.to_string(),
        }
    }
}

impl XllrCreateInfo {
    /// `XLLR_HOME` first, then every entry of `XLLR_PLUGIN_PATH`.
    pub fn from_env() -> Self {
        let mut info = Self::default();
        if let Some(home) = env::var_os(HOME_VAR) {
            if !home.is_empty() {
                info.plugin_dirs.push(PathBuf::from(home));
            }
        }
        if let Some(paths) = env::var_os(PLUGIN_PATH_VAR) {
            info.plugin_dirs.extend(
                env::split_paths(&paths).filter(|path| !path.as_os_str().is_empty()),
            );
        }
        info
    }

    pub fn library_file_name(&self, plugin: &str) -> String {
        format!(
            "{}{plugin}{}",
            self.library_prefix,
            env::consts::DLL_SUFFIX
        )
    }

    pub fn find_plugin(&self, plugin: &str) -> Result<PathBuf, XllrError> {
        let file_name = self.library_file_name(plugin);
        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| XllrError::PluginNotFound {
                name: plugin.to_string(),
                reason: if self.plugin_dirs.is_empty() {
                    format!(
                        "no plugin directories configured (set {HOME_VAR} or {PLUGIN_PATH_VAR})"
                    )
                } else {
                    let searched: Vec<String> = self
                        .plugin_dirs
                        .iter()
                        .map(|dir| dir.display().to_string())
                        .collect();
                    format!("`{file_name}` not in {}", searched.join(", "))
                },
            })
    }
}
