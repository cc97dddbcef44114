use std::path::PathBuf;

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub api_token: String,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            api_token: "slotbook".into(),
            metrics_port: None,
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse_u16 = |key: &str| lookup(key).and_then(|s| s.parse::<u16>().ok());
        Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            port: parse_u16("SLOTBOOK_PORT").unwrap_or(defaults.port),
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            api_token: lookup("SLOTBOOK_API_TOKEN").unwrap_or(defaults.api_token),
            metrics_port: parse_u16("SLOTBOOK_METRICS_PORT"),
            compact_threshold: lookup("SLOTBOOK_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[]));
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotbook.wal"));
        assert_eq!(config.api_token, "slotbook");
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.compact_threshold, 1000);
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = Config::from_lookup(lookup_from(&[
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_PORT", "not-a-port"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_COMPACT_THRESHOLD", "50"),
        ]));
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/slotbook/slotbook.wal"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
    }
}
