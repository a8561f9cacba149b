use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use url::form_urlencoded;

/// Where the engine gets its message stream from.
///
/// Serialised as its URL form so files, environment variables and flags all
/// spell it the same way.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// A host listening on a TCP socket.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port number.
        port: u16,
    },
    /// An external connector tool that announces a data server on stdout.
    Bridge {
        /// Executable to spawn.
        program: Utf8PathBuf,
        /// Arguments passed to the executable.
        args: Vec<String>,
    },
    /// A recorded log directory played back offline.
    Replay {
        /// Root of the log directory.
        directory: Utf8PathBuf,
        /// Recorded client whose view of the session is reproduced.
        client: Option<ReplayClient>,
    },
}

/// Which recorded client a replay reproduces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayClient {
    /// The client marked current in the first client listing, else the first
    /// listed client.
    Select,
    /// The client with this identifier.
    Uid(String),
}

impl Endpoint {
    /// Builds a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Builds a bridge endpoint.
    #[must_use]
    pub fn bridge(program: impl Into<Utf8PathBuf>, args: Vec<String>) -> Self {
        Self::Bridge {
            program: program.into(),
            args,
        }
    }

    /// Builds a replay endpoint.
    #[must_use]
    pub fn replay(directory: impl Into<Utf8PathBuf>) -> Self {
        Self::Replay {
            directory: directory.into(),
            client: None,
        }
    }

    /// Builds a replay endpoint that reproduces one recorded client.
    #[must_use]
    pub fn replay_as(directory: impl Into<Utf8PathBuf>, client: ReplayClient) -> Self {
        Self::Replay {
            directory: directory.into(),
            client: Some(client),
        }
    }

    /// Returns `true` for offline playback.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replay { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
            Self::Bridge { program, args } => {
                write!(formatter, "bridge://{program}")?;
                if !args.is_empty() {
                    let query = form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(args.iter().map(|arg| ("arg", arg.as_str())))
                        .finish();
                    write!(formatter, "?{query}")?;
                }
                Ok(())
            }
            Self::Replay { directory, client } => {
                write!(formatter, "replay://{directory}")?;
                match client {
                    None => Ok(()),
                    Some(ReplayClient::Select) => write!(formatter, "?select-client"),
                    Some(ReplayClient::Uid(uid)) => {
                        let query = form_urlencoded::Serializer::new(String::new())
                            .append_pair("client", uid)
                            .finish();
                        write!(formatter, "?{query}")
                    }
                }
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| EndpointParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
            "bridge" => {
                let program = non_empty_path(&url, input)?;
                let args = url
                    .query_pairs()
                    .filter(|(key, _)| key == "arg")
                    .map(|(_, value)| value.into_owned())
                    .collect();
                Ok(Self::bridge(program, args))
            }
            "replay" => {
                let directory = non_empty_path(&url, input)?;
                let client = url.query_pairs().find_map(|(key, value)| match key.as_ref() {
                    "client" => Some(ReplayClient::Uid(value.into_owned())),
                    "select-client" => Some(ReplayClient::Select),
                    _ => None,
                });
                Ok(Self::Replay {
                    directory: directory.into(),
                    client,
                })
            }
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

fn non_empty_path(url: &Url, input: &str) -> Result<String, EndpointParseError> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        return Err(EndpointParseError::MissingPath(input.to_owned()));
    }
    Ok(path.to_owned())
}

/// Errors encountered while parsing an [`Endpoint`] from text.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// Scheme was not one of `tcp`, `bridge` or `replay`.
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Program or directory path was missing.
    #[error("missing path in '{0}'")]
    MissingPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}
