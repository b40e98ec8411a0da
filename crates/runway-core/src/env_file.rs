//! Environment assembly for the supervised children.
//!
//! Children get a full copy of the supervisor's environment. Values from a
//! local env file only fill in names the real environment does not define.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::{DEFAULT_PORT, PORT_ENV};
use crate::error::RunwayError;

/// Read `KEY=VALUE` pairs from an env file.
///
/// A missing or unreadable file yields an empty map. Blank lines, `#`
/// comments and lines without `=` are skipped. Keys and values are trimmed
/// and surrounding quotes are removed; values are otherwise taken verbatim,
/// with no variable or escape expansion.
pub fn load_env_file(path: &Path) -> HashMap<String, String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No env file found");
            return HashMap::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read env file");
            return HashMap::new();
        }
    };
    parse_env(&contents, path)
}

fn parse_env(contents: &str, path: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(path = %path.display(), line = index + 1, "Skipping env file line without '='");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            debug!(path = %path.display(), line = index + 1, "Skipping env file line without a name");
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        values.insert(key.to_string(), value.to_string());
    }
    values
}

/// Merge the real environment with env-file values; the real environment wins.
pub fn merge_environment<I>(process_env: I, file_env: HashMap<String, String>) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut merged = file_env;
    merged.extend(process_env);
    merged
}

/// Port requested through `PORT`, or the default when unset.
pub fn requested_port(env: &HashMap<String, String>) -> Result<u16, RunwayError> {
    match env.get(PORT_ENV).map(|v| v.trim()) {
        None | Some("") => Ok(DEFAULT_PORT),
        Some(raw) => raw.parse::<u16>().map_err(|e| {
            RunwayError::ConfigurationError(format!("{PORT_ENV}={raw:?} is not a valid port: {e}"))
        }),
    }
}
