use std::fs;

use crate::models::AppConfig;
use crate::modules::persistence::data_dir;

const CONFIG_FILE: &str = "config.json";

pub fn load_app_config() -> Result<AppConfig, String> {
    let config_path = data_dir()?.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::new();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let config_path = data_dir()?.join(CONFIG_FILE);
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;
    crate::modules::persistence::atomic_write(&config_path, &content)
}
