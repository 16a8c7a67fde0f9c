use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub room_grace: Duration,
    pub cursor_throttle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            data_dir: PathBuf::from(".canvas-data"),
            room_grace: Duration::from_secs(60),
            cursor_throttle: Duration::from_millis(35),
        }
    }
}

impl Config {
    /// Reads configuration from the environment, falling back to the
    /// documented defaults when a variable is absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        let data_dir = std::env::var("CANVAS_DATA_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let room_grace = std::env::var("ROOM_GRACE_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.room_grace);

        let cursor_throttle = std::env::var("CURSOR_THROTTLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.cursor_throttle);

        Self {
            port,
            data_dir,
            room_grace,
            cursor_throttle,
        }
    }
}
