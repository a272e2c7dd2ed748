use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;
use sockrelay_model::Severity;

#[derive(Deserialize, Debug, Clone, Default, PartialEq, schemars::JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Settings for the relay itself
    pub relay: RelayOptions,
    /// Settings for the log sink
    pub log: LogConfig,
    /// The status and metrics server, disabled when absent
    pub ui: Option<UiServerConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, schemars::JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct RelayOptions {
    /// The address the listening socket binds to
    pub listen_address: IpAddr,
    /// Size of the buffer each direction of a session reads into
    pub buffer_size: usize,
    /// Length of the pending connection queue
    pub backlog: u32,
    /// Seconds allowed for connecting a session to the destination
    pub connect_timeout: u64,
    /// Seconds allowed for resolving the destination at start
    pub resolve_timeout: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            buffer_size: 1024,
            backlog: 10,
            connect_timeout: 10,
            resolve_timeout: 10,
        }
    }
}

impl RelayOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout)
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, schemars::JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Messages less severe than this are discarded
    pub min_severity: Severity,
}

#[derive(Deserialize, Debug, Clone, PartialEq, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UiServerConfig {
    /// The address the status server binds to
    pub listen_address: SocketAddr,
}
