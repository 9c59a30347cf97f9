use serde_json;
use std::fs;
use std::path::PathBuf;

use crate::proxy::ProxyConfig;

const CONFIG_FILE: &str = "proxy_config.json";

/// 数据目录 (UNLIMITED_DATA_DIR 可覆盖)
pub fn get_data_dir() -> Result<PathBuf, String> {
    let dir = match std::env::var("UNLIMITED_DATA_DIR") {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from("data"),
    };

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create data dir: {}", e))?;
    }

    Ok(dir)
}

/// Load proxy service configuration
pub fn load_config() -> Result<ProxyConfig, String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = ProxyConfig::default();
        let _ = save_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
}

/// Save proxy service configuration
pub fn save_config(config: &ProxyConfig) -> Result<(), String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(&config_path, content).map_err(|e| format!("Failed to save config: {}", e))
}
