use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Settings read from the JSON config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub fhir_base_url: Option<String>,
    pub access_token: Option<String>,
    pub timeout_secs: Option<u64>,
    pub interactive_default: Option<bool>,
}

pub fn client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("fhir-elicit/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fhir-elicit");
    config_dir.join("config.json")
}

/// Missing file is not an error; a malformed one is.
pub fn load_file_config() -> Result<Option<FileConfig>, String> {
    let path = config_path();
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("Failed to read {}: {e}", path.display())),
    };
    parse_file_config(&data)
        .map(Some)
        .map_err(|e| format!("Invalid config file {}: {e}", path.display()))
}

fn parse_file_config(data: &str) -> Result<FileConfig, serde_json::Error> {
    serde_json::from_str(data)
}
