use anyhow::{anyhow, Context, Result};
use std::fmt;
use url::Url;

use crate::credentials::{self, Credentials};
use crate::Endpoint;

const DEFAULT_RTSP_PORT: u16 = 554;

/// Resolved stream location for one camera.
///
/// The URL never carries credentials. They are kept apart so that the URL can
/// be logged as-is and handed to the media backend separately.
#[derive(Debug)]
pub struct StreamTarget {
    url: Url,
    credentials: Option<Credentials>,
}

impl StreamTarget {
    /// Build the target for an endpoint.
    ///
    /// An explicit `url` wins over address/port/path. Userinfo embedded in an
    /// explicit URL is moved out of it; a `credential_ref` overrides it.
    pub fn for_endpoint(endpoint: &Endpoint) -> Result<Self> {
        let mut url = match endpoint.url.as_deref() {
            Some(explicit) => Url::parse(explicit.trim())
                .with_context(|| format!("invalid stream url for {}", endpoint.address))?,
            None => build_rtsp_url(endpoint)?,
        };

        let mut credentials = take_userinfo(&mut url)?;
        if let Some(reference) = endpoint.credential_ref.as_deref() {
            credentials = Some(credentials::resolve(reference)?);
        }

        Ok(Self { url, credentials })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_synthetic(&self) -> bool {
        self.url.scheme() == "stub"
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(creds) => write!(f, "{} (as {})", self.url, creds.username),
            None => write!(f, "{}", self.url),
        }
    }
}

fn build_rtsp_url(endpoint: &Endpoint) -> Result<Url> {
    let address = endpoint.address.trim();
    if address.is_empty() {
        return Err(anyhow!("endpoint has neither a url nor an address"));
    }
    let host = if address.contains(':') && !address.starts_with('[') {
        format!("[{}]", address)
    } else {
        address.to_string()
    };
    let port = if endpoint.port == 0 {
        DEFAULT_RTSP_PORT
    } else {
        endpoint.port
    };
    let raw = format!(
        "rtsp://{}:{}/{}",
        host,
        port,
        endpoint.path.trim().trim_start_matches('/')
    );
    Url::parse(&raw).with_context(|| format!("invalid rtsp endpoint {}:{}", address, port))
}

fn take_userinfo(url: &mut Url) -> Result<Option<Credentials>> {
    if url.username().is_empty() {
        return Ok(None);
    }
    let creds = Credentials {
        username: url.username().to_string(),
        password: url.password().unwrap_or_default().to_string(),
    };
    let scheme = url.scheme().to_string();
    if url.set_username("").is_err() || url.set_password(None).is_err() {
        return Err(anyhow!("cannot strip credentials from {} url", scheme));
    }
    Ok(Some(creds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_rtsp_url_from_parts() {
        let endpoint = Endpoint::new("10.0.0.7", 8554, "/live/main");
        let target = StreamTarget::for_endpoint(&endpoint).unwrap();
        assert_eq!(target.url().as_str(), "rtsp://10.0.0.7:8554/live/main");
        assert!(target.credentials().is_none());
        assert!(!target.is_synthetic());
    }

    #[test]
    fn defaults_port_and_brackets_ipv6() {
        let endpoint = Endpoint::new("fe80::1", 0, "stream");
        let target = StreamTarget::for_endpoint(&endpoint).unwrap();
        assert_eq!(target.url().as_str(), "rtsp://[fe80::1]:554/stream");
    }

    #[test]
    fn moves_embedded_credentials_out_of_url() {
        let endpoint = Endpoint::from_url("rtsp://admin:pw@cam.local/h264");
        let target = StreamTarget::for_endpoint(&endpoint).unwrap();
        assert_eq!(target.url().as_str(), "rtsp://cam.local/h264");
        assert_eq!(target.credentials().map(|c| c.password.as_str()), Some("pw"));
        assert!(!target.to_string().contains("pw"));
    }

    #[test]
    fn credential_ref_is_resolved() {
        std::env::set_var("ROADWATCH_TEST_TARGET_CREDS", "viewer:abc");
        let endpoint = Endpoint::new("cam.local", 554, "s0")
            .with_credential_ref("env:ROADWATCH_TEST_TARGET_CREDS");
        let target = StreamTarget::for_endpoint(&endpoint).unwrap();
        assert_eq!(target.credentials().map(|c| c.username.as_str()), Some("viewer"));
        std::env::remove_var("ROADWATCH_TEST_TARGET_CREDS");
    }

    #[test]
    fn stub_urls_are_synthetic() {
        let target = StreamTarget::for_endpoint(&Endpoint::from_url("stub://lobby")).unwrap();
        assert!(target.is_synthetic());
        assert!(StreamTarget::for_endpoint(&Endpoint::new("", 554, "x")).is_err());
    }
}
