//! Keyword connection strings.
//!
//! Connection strings use the semicolon-delimited `Key=Value` format:
//!
//! ```text
//! Server=$ServerName;Port=5432;Database=hr;User Id=app;Password=secret;Max Pool Size=20
//! ```
//!
//! Keys are matched case-insensitively and surrounding whitespace is ignored.
//! The string itself is never normalized: it is the identity key of its pool.

use tracing::warn;

/// Default number of slots for a connection string without `Max Pool Size`.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// Placeholder replaced by the server-name-aware provider.
pub const SERVER_NAME_PLACEHOLDER: &str = "$ServerName";

const MAX_POOL_SIZE_KEY: &str = "max pool size";

const SECRET_KEYS: &[&str] = &["password", "pwd"];

/// A parsed view over a keyword connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKeywords {
    pairs: Vec<(String, String)>,
}

impl ConnectionKeywords {
    /// Parse a keyword connection string.
    ///
    /// Segments without `=` and empty segments are ignored. Later duplicates
    /// win on lookup.
    pub fn parse(connection_string: &str) -> Self {
        let pairs = connection_string
            .split(';')
            .filter_map(|segment| {
                let (key, value) = segment.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_ascii_lowercase(), value.trim().to_string()))
            })
            .collect();
        Self { pairs }
    }

    /// Look up a value by key (case-insensitive). The last occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up the first key present among several aliases.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Parse a boolean keyword (`true`/`false`/`yes`/`no`, case-insensitive).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)?.to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Iterate over the lowercased keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }
}

/// Read the pool size bound from a connection string.
///
/// Falls back to [`DEFAULT_MAX_POOL_SIZE`] when the token is absent,
/// not a number, or zero.
pub fn max_pool_size(connection_string: &str) -> u32 {
    let keywords = ConnectionKeywords::parse(connection_string);
    match keywords.get(MAX_POOL_SIZE_KEY) {
        None => DEFAULT_MAX_POOL_SIZE,
        Some(raw) => match raw.parse::<u32>() {
            Ok(size) if size > 0 => size,
            _ => {
                warn!(value = %raw, "Ignoring malformed Max Pool Size");
                DEFAULT_MAX_POOL_SIZE
            }
        },
    }
}

/// Substitute the server-name placeholder.
pub fn with_server_name(connection_string: &str, server_name: &str) -> String {
    connection_string.replace(SERVER_NAME_PLACEHOLDER, server_name)
}

/// Get a display-safe version of the connection string (passwords masked).
pub fn masked(connection_string: &str) -> String {
    connection_string
        .split(';')
        .map(|segment| match segment.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_ascii_lowercase().as_str()) => {
                format!("{}=****", key)
            }
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_pool_size_present() {
        assert_eq!(max_pool_size("Server=db;Max Pool Size=20"), 20);
    }

    #[test]
    fn test_max_pool_size_case_insensitive_and_spaced() {
        assert_eq!(max_pool_size("Server=db; max pool size = 7 ;Database=hr"), 7);
        assert_eq!(max_pool_size("MAX POOL SIZE=3"), 3);
    }

    #[test]
    fn test_max_pool_size_defaults() {
        assert_eq!(max_pool_size("Server=db;Database=hr"), DEFAULT_MAX_POOL_SIZE);
        assert_eq!(max_pool_size("Max Pool Size=lots"), DEFAULT_MAX_POOL_SIZE);
        assert_eq!(max_pool_size("Max Pool Size=0"), DEFAULT_MAX_POOL_SIZE);
        assert_eq!(max_pool_size("Max Pool Size=-4"), DEFAULT_MAX_POOL_SIZE);
        assert_eq!(max_pool_size(""), DEFAULT_MAX_POOL_SIZE);
    }

    #[test]
    fn test_keywords_lookup() {
        let keywords = ConnectionKeywords::parse("Server=a;Initial Catalog=hr;;junk;User Id=app");
        assert_eq!(keywords.get("server"), Some("a"));
        assert_eq!(keywords.get_any(&["database", "initial catalog"]), Some("hr"));
        assert_eq!(keywords.get("USER ID"), Some("app"));
        assert_eq!(keywords.get("junk"), None);
        assert_eq!(keywords.keys().count(), 3);
    }

    #[test]
    fn test_keywords_last_value_wins() {
        let keywords = ConnectionKeywords::parse("Port=1;Port=2");
        assert_eq!(keywords.get("port"), Some("2"));
    }

    #[test]
    fn test_keywords_bool() {
        let keywords = ConnectionKeywords::parse("Read Only=TRUE;Pooling=no;Odd=maybe");
        assert_eq!(keywords.get_bool("read only"), Some(true));
        assert_eq!(keywords.get_bool("pooling"), Some(false));
        assert_eq!(keywords.get_bool("odd"), None);
    }

    #[test]
    fn test_server_name_substitution() {
        let resolved = with_server_name("Server=$ServerName;Database=hr", "db-eu-1");
        assert_eq!(resolved, "Server=db-eu-1;Database=hr");
        assert_eq!(with_server_name("Server=fixed", "ignored"), "Server=fixed");
    }

    #[test]
    fn test_masked_hides_passwords() {
        let masked = masked("Server=db;User Id=app;Password=hunter2;PWD=x");
        assert!(!masked.contains("hunter2"));
        assert!(masked.contains("Password=****"));
        assert!(masked.contains("PWD=****"));
        assert!(masked.contains("User Id=app"));
    }
}
