use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge, info::Info},
    registry::Registry,
};

use crate::session::Direction;

/// These are the labels used for the `build_info` metric.
#[derive(EncodeLabelSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildInfo {
    pub branch: &'static str,
    pub commit: &'static str,
    pub version: &'static str,
    pub service_name: &'static str,
    pub repo_url: &'static str,
}

#[derive(EncodeLabelValue, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseOutcome {
    Graceful,
    Error,
}

#[derive(EncodeLabelSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloseLabels {
    pub outcome: CloseOutcome,
}

#[derive(EncodeLabelSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectionLabels {
    pub direction: Direction,
}

#[derive(Default, Clone)]
pub struct RelayMetrics {
    pub connections_accepted: Counter,
    pub upstream_connect_failures: Counter,
    pub active_sessions: Gauge,
    pub sessions_closed: Family<CloseLabels, Counter>,
    pub bytes_relayed: Family<DirectionLabels, Counter>,
}

#[cfg_attr(not(feature = "ui"), allow(dead_code))]
pub fn create_registry(metrics: &RelayMetrics) -> Registry {
    let mut registry = Registry::default();

    registry.register(
        "build",
        "Info metric for tracking software version and build details",
        Info::new(BuildInfo {
            branch: option_env!("VERGEN_GIT_BRANCH").unwrap_or("unknown"),
            commit: option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
            version: env!("CARGO_PKG_VERSION"),
            service_name: env!("CARGO_PKG_NAME"),
            repo_url: env!("CARGO_PKG_REPOSITORY"),
        }),
    );

    registry.register(
        "connections_accepted",
        "amount of incoming connections accepted by the relay",
        metrics.connections_accepted.clone(),
    );
    registry.register(
        "upstream_connect_failures",
        "amount of accepted connections that could not be connected to the destination",
        metrics.upstream_connect_failures.clone(),
    );
    registry.register(
        "active_sessions",
        "amount of relay sessions currently copying",
        metrics.active_sessions.clone(),
    );
    registry.register(
        "sessions_closed",
        "amount of relay sessions that have been torn down",
        metrics.sessions_closed.clone(),
    );
    registry.register(
        "bytes_relayed",
        "amount of bytes forwarded, by direction",
        metrics.bytes_relayed.clone(),
    );

    registry
}
