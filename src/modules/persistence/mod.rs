pub mod accounts;
pub mod local_db;

use std::fs;
use std::path::{Path, PathBuf};

pub fn data_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        }
        Ok(())
    }
    if let Ok(env_path) = std::env::var("DATA_DIR") {
        if !env_path.trim().is_empty() {
            let dir = PathBuf::from(env_path);
            ensure_dir(&dir)?;
            return Ok(dir);
        }
    }
    if cfg!(test) {
        let dir = std::env::temp_dir().join(format!(".viaduct-test-{}", std::process::id()));
        ensure_dir(&dir)?;
        return Ok(dir);
    }

    if let Some(home) = dirs::home_dir() {
        let dir = home.join(".viaduct");
        ensure_dir(&dir)?;
        return Ok(dir);
    }
    Err("could_not_resolve_home_directory".to_string())
}

// Write-to-temp then rename so a crash mid-write never leaves a torn file.
pub fn atomic_write(path: &Path, content: &str) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("no_parent_directory_for: {}", path.display()))?;
    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| format!("failed_to_create_parent_dir: {}", e))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(|e| format!("failed_to_write_temp_file: {}", e))?;
    fs::rename(&tmp_path, path).map_err(|e| format!("failed_to_commit_file: {}", e))
}
