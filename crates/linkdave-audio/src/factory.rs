use std::net::IpAddr;
use std::sync::Arc;

use url::{Host, Url};

use crate::config::SourceConfig;
use crate::mp3::Mp3Source;
use crate::source::{Source, SourceError, SourceFactory};

/// Builds MP3 sources for `http(s)` URLs, enforcing the node's source policy.
pub struct HttpSourceFactory {
    config: SourceConfig,
}

impl HttpSourceFactory {
    pub fn new(config: SourceConfig) -> HttpSourceFactory {
        HttpSourceFactory { config }
    }

    fn check_policy(&self, url: &str) -> Result<(), SourceError> {
        let parsed = Url::parse(url).map_err(|e| SourceError::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "http" if self.config.http_enabled => {}
            "https" if self.config.https_enabled => {}
            "http" | "https" => {
                return Err(SourceError::SchemeDisabled(parsed.scheme().to_string()))
            }
            other => return Err(SourceError::UnsupportedScheme(other.to_string())),
        }

        let addr: Option<IpAddr> = match parsed.host() {
            Some(Host::Ipv4(v4)) => Some(v4.into()),
            Some(Host::Ipv6(v6)) => Some(v6.into()),
            _ => None,
        };
        if let Some(addr) = addr {
            let private = is_private_address(addr);
            if private && !self.config.private_ip_enabled {
                return Err(SourceError::AddressBlocked(addr.to_string()));
            }
            if !private && !self.config.public_ip_enabled {
                return Err(SourceError::AddressBlocked(addr.to_string()));
            }
        }

        Ok(())
    }
}

impl SourceFactory for HttpSourceFactory {
    fn create_from_url(
        &self,
        url: &str,
        start_time_ms: i64,
    ) -> Result<Arc<dyn Source>, SourceError> {
        self.check_policy(url)?;
        Ok(Arc::new(Mp3Source::open(url, start_time_ms)?))
    }
}

fn is_private_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(config: SourceConfig) -> HttpSourceFactory {
        HttpSourceFactory::new(config)
    }

    #[test]
    fn rejects_unknown_scheme() {
        let f = factory(SourceConfig::permissive());
        let err = f.check_policy("ftp://host/a.mp3").unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_disabled_scheme() {
        let f = factory(SourceConfig {
            https_enabled: true,
            ..SourceConfig::default()
        });
        let err = f.check_policy("http://host/a.mp3").unwrap_err();
        assert!(matches!(err, SourceError::SchemeDisabled(_)));
        f.check_policy("https://host/a.mp3").unwrap();
    }

    #[test]
    fn gates_private_addresses() {
        let f = factory(SourceConfig {
            http_enabled: true,
            public_ip_enabled: true,
            ..SourceConfig::default()
        });
        let err = f.check_policy("http://127.0.0.1:9000/a.mp3").unwrap_err();
        assert!(matches!(err, SourceError::AddressBlocked(_)));
        let err = f.check_policy("http://192.168.1.10/a.mp3").unwrap_err();
        assert!(matches!(err, SourceError::AddressBlocked(_)));
    }

    #[test]
    fn gates_public_addresses() {
        let f = factory(SourceConfig {
            http_enabled: true,
            private_ip_enabled: true,
            ..SourceConfig::default()
        });
        let err = f.check_policy("http://93.184.216.34/a.mp3").unwrap_err();
        assert!(matches!(err, SourceError::AddressBlocked(_)));
        f.check_policy("http://10.0.0.5/a.mp3").unwrap();
    }

    #[test]
    fn hostnames_skip_ip_gates() {
        let f = factory(SourceConfig {
            http_enabled: true,
            ..SourceConfig::default()
        });
        f.check_policy("http://audio.example.com/a.mp3").unwrap();
    }

    #[test]
    fn invalid_url_is_reported() {
        let f = factory(SourceConfig::permissive());
        assert!(matches!(
            f.check_policy("::not a url::"),
            Err(SourceError::InvalidUrl(_))
        ));
    }
}
