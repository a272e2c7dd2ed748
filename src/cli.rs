use std::path::PathBuf;

use clap::Parser;
use sockrelay_model::{Destination, Severity};

/// Listen on a local port and relay every connection to a fixed destination
#[derive(Parser, Debug)]
#[command(
    name = "sockrelay",
    version,
    after_help = "Example: sockrelay 12345 www.webserver.com 443\n    \
                  (opens a local listening port on 12345 which redirects traffic to www.webserver.com:443)"
)]
pub struct Cli {
    /// Local port to accept connections on
    pub listen_port: u16,

    /// Host every connection is relayed to
    pub destination_host: String,

    /// Port on the destination host
    pub destination_port: u16,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides `log.min_severity` from the configuration file
    #[arg(long)]
    pub min_severity: Option<Severity>,
}

impl Cli {
    pub fn destination(&self) -> Destination {
        Destination::new(self.destination_host.as_str(), self.destination_port)
    }
}
