use std::env;
use std::str::FromStr;

/// How to read the `X-RateLimit-Reset` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Absolute Unix epoch seconds.
    Epoch,
    /// Seconds until the window rolls over.
    Relative,
}

impl FromStr for ResetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoch" | "absolute" => Ok(ResetMode::Epoch),
            "relative" | "seconds" => Ok(ResetMode::Relative),
            other => Err(format!(
                "Invalid QUOTA_RESET_MODE '{}': expected epoch or relative",
                other
            )),
        }
    }
}

impl ResetMode {
    /// Read `QUOTA_RESET_MODE` alone; local tracker writes need nothing else.
    pub fn from_env() -> Result<Self, String> {
        match env::var("QUOTA_RESET_MODE") {
            Ok(s) => s.parse::<ResetMode>(),
            Err(_) => Ok(ResetMode::Epoch),
        }
    }
}

/// Runtime configuration for the API the tracker observes.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub status_path: String,
    pub token: Option<String>,
    pub reset_mode: ResetMode,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            status_path: "/health/rate-limits-status".to_string(),
            token: None,
            reset_mode: ResetMode::Epoch,
            user_agent: format!("quota-tracker/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - QUOTA_API_URL (default: http://localhost:8000/api)
    /// - QUOTA_STATUS_PATH (default: /health/rate-limits-status)
    /// - QUOTA_API_TOKEN (optional bearer token)
    /// - QUOTA_RESET_MODE (epoch | relative, default: epoch)
    /// - QUOTA_HTTP_TIMEOUT_SECS (default: 30)
    /// - QUOTA_USER_AGENT (default: quota-tracker/<version>)
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let api_url = env::var("QUOTA_API_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        if url::Url::parse(&api_url).is_err() {
            return Err(format!("Invalid QUOTA_API_URL: {}", api_url));
        }
        let status_path = env::var("QUOTA_STATUS_PATH").unwrap_or(defaults.status_path);
        let token = env::var("QUOTA_API_TOKEN").ok().filter(|t| !t.is_empty());
        let reset_mode = ResetMode::from_env()?;
        let timeout_secs = env::var("QUOTA_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.timeout_secs);
        let user_agent = env::var("QUOTA_USER_AGENT").unwrap_or(defaults.user_agent);

        Ok(Self {
            api_url,
            status_path,
            token,
            reset_mode,
            user_agent,
            timeout_secs,
        })
    }

    /// Join a request path onto the API base.
    ///
    /// Absolute URLs are accepted only on the same origin as `api_url`, so the
    /// bearer token never leaves the configured API.
    pub fn endpoint(&self, path: &str) -> Result<String, String> {
        let base = url::Url::parse(&self.api_url)
            .map_err(|e| format!("Invalid API URL {}: {}", self.api_url, e))?;
        match url::Url::parse(path) {
            Ok(target) if target.origin() == base.origin() => return Ok(target.to_string()),
            Ok(_) => {
                return Err(format!(
                    "Refusing request to {}: origin differs from {}",
                    path, self.api_url
                ))
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {}
            Err(e) => return Err(format!("Invalid URL {}: {}", path, e)),
        }
        Ok(format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}
