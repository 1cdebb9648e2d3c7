//! Resolution of the project root and the data/log paths derived from it.

use std::path::PathBuf;

/// Environment variable controlling where model files, hint files and
/// performance logs are resolved.
pub const PROJECT_ROOT_ENV: &str = "HONYGO_PROJECT_ROOT";

/// Resolve the project root.
///
/// Uses `HONYGO_PROJECT_ROOT` when set (must be an absolute path), the
/// current working directory otherwise.
pub fn project_root() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os(PROJECT_ROOT_ENV) {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("{PROJECT_ROOT_ENV} is set but empty");
        }
        if !dir.is_absolute() {
            anyhow::bail!(
                "{PROJECT_ROOT_ENV} must be an absolute path, got {}",
                dir.display()
            );
        }
        return Ok(dir);
    }
    Ok(std::env::current_dir()?)
}

/// Path of the optional pool configuration file.
pub fn config_file(root: &std::path::Path) -> PathBuf {
    root.join("config").join("ocr_pool.json")
}

/// Path of the region-history hint file.
pub fn region_history_file(root: &std::path::Path) -> PathBuf {
    root.join("data").join("ocr").join("region_history.json")
}

/// Directory holding the daily performance logs.
pub fn performance_log_dir(root: &std::path::Path) -> PathBuf {
    root.join("data").join("logs").join("Performance")
}

/// Default model storage directory when the configuration names none.
pub fn default_model_dir(root: &std::path::Path) -> PathBuf {
    root.join("data").join("models")
}
