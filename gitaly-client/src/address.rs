use std::fmt;
use std::str::FromStr;
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AddressError {
    #[error("invalid address {address:?}: {reason}")]
    Invalid { address: String, reason: String },

    #[error(
        "Unsupported Gitaly address: {0:?} does not use URL scheme 'tcp' or 'unix' or 'tls' or 'dns'"
    )]
    UnsupportedScheme(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Unix,
    Dns,
}

/// A validated Gitaly server address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitalyAddress {
    raw: String,
    scheme: Scheme,
}

impl GitalyAddress {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Whether the channel to this address needs TLS credentials.
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Tls
    }

    /// The dial target handed to the channel. `tcp://` and `tls://` prefixes
    /// are stripped, `unix:` and `dns:` targets are passed as-is.
    pub fn target(&self) -> &str {
        match self.scheme {
            Scheme::Tcp => self.raw.strip_prefix("tcp://").unwrap_or(&self.raw),
            Scheme::Tls => self.raw.strip_prefix("tls://").unwrap_or(&self.raw),
            Scheme::Unix | Scheme::Dns => &self.raw,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for GitalyAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| AddressError::Invalid {
            address: s.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = match url.scheme() {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "unix" => Scheme::Unix,
            "dns" => Scheme::Dns,
            _ => return Err(AddressError::UnsupportedScheme(s.to_string())),
        };

        Ok(GitalyAddress {
            raw: s.to_string(),
            scheme,
        })
    }
}

impl fmt::Display for GitalyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
