//! Camera credential references.
//!
//! Persistence stores a *reference* to a camera's credentials, never the
//! credentials themselves. References are resolved only when a connection URL is
//! built:
//! - `env:VAR`   - the variable holds `user:password`
//! - `file:PATH` - the file's first line holds `user:password`
//!
//! Resolved passwords are zeroized on drop.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    fn parse(raw: &str) -> Result<Self> {
        let (username, password) = raw
            .trim_end_matches(['\r', '\n'])
            .split_once(':')
            .ok_or_else(|| anyhow!("credential value must be 'user:password'"))?;
        if username.is_empty() {
            return Err(anyhow!("credential username is empty"));
        }
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Resolve a credential reference.
pub fn resolve(reference: &str) -> Result<Credentials> {
    if let Some(var) = reference.strip_prefix("env:") {
        let mut value =
            std::env::var(var).map_err(|_| anyhow!("credential variable {} is not set", var))?;
        let creds = Credentials::parse(&value);
        value.zeroize();
        return creds;
    }
    if let Some(path) = reference.strip_prefix("file:") {
        let mut raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credential file {}", path))?;
        let creds = raw
            .lines()
            .next()
            .ok_or_else(|| anyhow!("credential file {} is empty", path))
            .and_then(Credentials::parse);
        raw.zeroize();
        return creds;
    }
    Err(anyhow!(
        "unsupported credential reference '{}' (expected env: or file:)",
        reference
    ))
}
