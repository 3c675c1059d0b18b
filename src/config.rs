use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Skinovation";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Clinic identity used in SMS templates and notifications.
pub const CLINIC_NAME: &str = "Skinovation Clinic";
pub const CLINIC_PHONE: &str = "09123456789";
pub const CLINIC_ADDRESS: &str = "Bayombong, Nueva Vizcaya";

/// Slot capacity per (date, time, attendant).
pub const SLOT_CAPACITY: i64 = 3;

/// Leave requests can be filed at most this many days ahead.
pub const LEAVE_HORIZON_DAYS: i64 = 30;

/// Get the application data directory (~/Skinovation/)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

/// Path to the SQLite database file
pub fn database_path() -> PathBuf {
    app_data_dir().join("clinic.db")
}

pub fn default_log_filter() -> String {
    "skinovation=info".to_string()
}

/// SMS provider settings, read from the environment. Missing settings
/// disable outbound SMS; attempts are still recorded as failed.
#[derive(Debug, Clone)]
pub struct SmsSettings {
    pub base_url: String,
    pub api_token: String,
}

impl SmsSettings {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SKINOVATION_SMS_BASE_URL").ok()?;
        let api_token = std::env::var("SKINOVATION_SMS_TOKEN").ok()?;
        Some(Self { base_url, api_token })
    }
}

/// Port for the HTTP API (env `SKINOVATION_PORT`, default 8080).
pub fn api_port() -> u16 {
    std::env::var("SKINOVATION_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}
