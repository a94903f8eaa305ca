//! URIs accepted by channel constructors and redirects.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use url::Url;

/// Schemes served by channel actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            Self::Ftp => 21,
        }
    }
}

/// Canonical URI of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    parsed: Url,
    scheme: Scheme,
}

impl ChannelUri {
    pub fn parse(input: &str) -> BrowserResult<Self> {
        let mut parsed = Url::parse(input).map_err(|error| {
            BrowserError::new(
                "net.uri.invalid",
                format!("failed to parse channel URI `{input}`: {error}"),
            )
        })?;

        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "ftp" => Scheme::Ftp,
            other => {
                return Err(BrowserError::new(
                    "net.uri.scheme_unsupported",
                    format!("no channel implementation for scheme `{other}`"),
                ));
            }
        };

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(BrowserError::new(
                "net.uri.host_missing",
                "channel URI must include a host",
            ));
        }

        parsed.set_fragment(None);
        Ok(Self { parsed, scheme })
    }

    pub fn as_str(&self) -> &str {
        self.parsed.as_str()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        self.parsed.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.parsed
            .port()
            .unwrap_or_else(|| self.scheme.default_port())
    }

    /// `scheme://host[:port]`, with the port omitted when it is the default.
    pub fn origin(&self) -> String {
        match self.parsed.port() {
            Some(port) if port != self.scheme.default_port() => {
                format!("{}://{}:{port}", self.scheme.as_str(), self.host())
            }
            _ => format!("{}://{}", self.scheme.as_str(), self.host()),
        }
    }

    pub fn same_origin(&self, other: &Self) -> bool {
        self.scheme == other.scheme && self.host() == other.host() && self.port() == other.port()
    }

    /// Last path segment, used as the resource name of FTP listings and files.
    pub fn resource_name(&self) -> Option<&str> {
        self.parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
    }
}
