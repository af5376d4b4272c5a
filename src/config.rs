use std::path::PathBuf;

use crate::error::Error;
use crate::Result;

/// Validated broker credentials, resolved before the core is
/// constructed. The core never parses secrets itself.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
}

impl Credentials {
    /// Load `<PREFIX>_API_KEY`, `<PREFIX>_API_SECRET` and
    /// `<PREFIX>_ACCESS_TOKEN` from the environment.
    ///
    /// When the access token variable is unset, falls back to reading
    /// the file named by `ACCESS_TOKEN_FILE` (daily token drops written
    /// by the broker login flow).
    pub fn from_env(prefix: &str) -> Result<Self> {
        let api_key = env_var(&format!("{prefix}_API_KEY"));
        let api_secret = env_var(&format!("{prefix}_API_SECRET"));
        let access_token = env_var(&format!("{prefix}_ACCESS_TOKEN")).or_else(token_from_file);

        let mut missing = Vec::new();
        if api_key.is_none() {
            missing.push(format!("{prefix}_API_KEY"));
        }
        if api_secret.is_none() {
            missing.push(format!("{prefix}_API_SECRET"));
        }
        if access_token.is_none() {
            missing.push(format!("{prefix}_ACCESS_TOKEN"));
        }

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing credentials: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            api_key: api_key.unwrap_or_default(),
            api_secret: api_secret.unwrap_or_default(),
            access_token: access_token.unwrap_or_default(),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn token_from_file() -> Option<String> {
    let path = PathBuf::from(env_var("ACCESS_TOKEN_FILE")?);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let token = contents.trim().to_string();
            if token.is_empty() {
                None
            } else {
                tracing::info!(file = %path.display(), "access token loaded from file");
                Some(token)
            }
        }
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "access token file unreadable");
            None
        }
    }
}
