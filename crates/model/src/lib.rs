use std::{borrow::Cow, error::Error, fmt::Display, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

/// The fixed endpoint every relayed connection is forwarded to.
///
/// Resolution into a socket address is deferred until the relay starts, so a
/// destination that does not resolve can still be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: Arc<str>,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Destination {
            host: host.into(),
            port,
        }
    }

    /// Host and port in the shape accepted by `tokio::net::lookup_host`.
    pub fn addr(&self) -> (&str, u16) {
        (&*self.host, self.port)
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseDestinationError {
    MissingPort,
    EmptyHost,
    InvalidPort(String),
}

impl Display for ParseDestinationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseDestinationError::MissingPort => write!(f, "expected <host>:<port>"),
            ParseDestinationError::EmptyHost => write!(f, "host must not be empty"),
            ParseDestinationError::InvalidPort(port) => {
                write!(f, "`{port}` is not a valid u16 port")
            }
        }
    }
}

impl Error for ParseDestinationError {}

impl FromStr for Destination {
    type Err = ParseDestinationError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        // rsplit so bracketed IPv6 literals keep their colons
        let (host, port) = v
            .rsplit_once(':')
            .ok_or(ParseDestinationError::MissingPort)?;

        let host = host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(ParseDestinationError::EmptyHost);
        }

        let port = port
            .parse()
            .map_err(|_| ParseDestinationError::InvalidPort(port.to_owned()))?;

        Ok(Destination::new(host, port))
    }
}

impl<'d> Deserialize<'d> for Destination {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'d>,
    {
        struct DestinationVisitor;

        impl<'d> serde::de::Visitor<'d> for DestinationVisitor {
            type Value = Destination;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(
                    formatter,
                    "a string like <host_name>:<port> pair where <port> is a u16 value"
                )
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse()
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_str(DestinationVisitor)
    }
}

impl Serialize for Destination {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl schemars::JsonSchema for Destination {
    fn schema_name() -> Cow<'static, str> {
        "Destination".into()
    }

    fn schema_id() -> Cow<'static, str> {
        // Include the module, in case a type with the same name is in another module/crate
        concat!(module_path!(), "::Destination").into()
    }

    fn json_schema(_generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": "string",
            "description": "<host>:<port>"
        })
    }
}

/// Importance of a log message, ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
pub enum Severity {
    #[default]
    #[serde(alias = "verbose")]
    Verbose,
    #[serde(alias = "trace")]
    Trace,
    #[serde(alias = "information", alias = "info")]
    Information,
    #[serde(alias = "warning", alias = "warn")]
    Warning,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "critical")]
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Verbose,
        Severity::Trace,
        Severity::Information,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Verbose => "Verbose",
            Severity::Trace => "Trace",
            Severity::Information => "Information",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSeverityError(String);

impl Display for ParseSeverityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown severity `{}`, expected one of verbose, trace, information, warning, error, critical",
            self.0
        )
    }
}

impl Error for ParseSeverityError {}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "verbose" => Ok(Severity::Verbose),
            "trace" => Ok(Severity::Trace),
            "information" | "info" => Ok(Severity::Information),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseSeverityError(s.to_owned())),
        }
    }
}
