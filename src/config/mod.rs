mod schema;

pub use schema::*;

use std::path::Path;

use crate::error::{Error, Result};

/// Parse driver configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| Error::InvalidArgument(format!("bad config: {e}")))
}

/// Load driver configuration from a TOML file. Failures surface through the
/// crate error taxonomy; a missing or malformed file is a caller mistake,
/// not a transport condition.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidArgument(format!("config {}: {e}", path.display())))?;
    parse_config(&content)
}
