use std::path::Path;

use tokio::{fs, io};
use tracing_error::{InstrumentError, InstrumentResult, TracedError};

pub mod schema;

pub use schema::Config;

/// Read and parse a TOML configuration file.
#[tracing::instrument(err)]
pub async fn load(path: &Path) -> Result<Config, TracedError<io::Error>> {
    let contents = fs::read_to_string(path).await.in_current_span()?;

    parse(&contents).map_err(InstrumentError::in_current_span)
}

pub fn parse(contents: &str) -> Result<Config, io::Error> {
    toml::from_str(contents).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}
