use rusqlite::{Connection, OptionalExtension};
use std::path::PathBuf;

const TOKEN_KEY: &str = "antigravityAuthState";

// Platform-appropriate location of the IDE's key-value state database.
pub fn state_db_path() -> Result<PathBuf, String> {
    #[cfg(target_os = "macos")]
    {
        let home = dirs::home_dir().ok_or("Failed to get home directory")?;
        Ok(home.join("Library/Application Support/Antigravity/User/globalStorage/state.vscdb"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map_err(|_| "Failed to get APPDATA environment variable".to_string())?;
        Ok(PathBuf::from(appdata).join("Antigravity\\User\\globalStorage\\state.vscdb"))
    }

    #[cfg(target_os = "linux")]
    {
        let home = dirs::home_dir().ok_or("Failed to get home directory")?;
        Ok(home.join(".config/Antigravity/User/globalStorage/state.vscdb"))
    }
}

fn read_token_from(path: &PathBuf) -> Result<String, String> {
    if !path.exists() {
        return Err(format!("local_state_db_not_found: {}", path.display()));
    }
    let conn =
        Connection::open(path).map_err(|e| format!("failed_to_open_state_db: {}", e))?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM ItemTable WHERE key = ?1",
            [TOKEN_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("failed_to_query_state_db: {}", e))?;

    let raw = raw.ok_or_else(|| format!("state_db_missing_key: {}", TOKEN_KEY))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| format!("failed_to_parse_state_db_value: {}", e))?;
    value
        .get("accessToken")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
        .ok_or_else(|| "state_db_value_missing_access_token".to_string())
}

// Access token for a local-db credential, read from the IDE state database.
pub fn read_access_token() -> Result<String, String> {
    read_token_from(&state_db_path()?)
}
