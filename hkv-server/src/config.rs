//! # Server Configuration
//!
//! Purpose: load the toml config recognized by the process (§6). Every key
//! has a sensible default so a config file only needs to override what it
//! cares about; unknown keys are ignored rather than rejected.

use serde::Deserialize;

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_dir() -> String {
    ".".to_string()
}

fn default_databases() -> usize {
    16
}

fn default_appendfilename() -> String {
    "appendonly.aof".to_string()
}

fn default_appendfsync() -> String {
    "everysec".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dir")]
    pub dir: String,
    #[serde(default = "default_databases")]
    pub databases: usize,
    #[serde(default)]
    pub appendonly: bool,
    #[serde(default = "default_appendfilename")]
    pub appendfilename: String,
    #[serde(default = "default_appendfsync")]
    pub appendfsync: String,
    #[serde(default)]
    pub requirepass: Option<String>,
    #[serde(default)]
    pub peers: String,
    #[serde(rename = "self", default)]
    pub self_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            port: default_port(),
            dir: default_dir(),
            databases: default_databases(),
            appendonly: false,
            appendfilename: default_appendfilename(),
            appendfsync: default_appendfsync(),
            requirepass: None,
            peers: String::new(),
            self_addr: None,
        }
    }
}

impl Config {
    /// Parses a toml document. Missing/unknown keys never fail the load;
    /// a malformed value for a recognized key does.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reads and parses `path`; an absent file falls back to all-defaults
    /// rather than erroring, since `bind`/`port`/... are all optional.
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e),
        }
    }

    pub fn fsync_policy(&self) -> hkv_aof::FsyncPolicy {
        match self.appendfsync.as_str() {
            "always" => hkv_aof::FsyncPolicy::Always,
            "no" => hkv_aof::FsyncPolicy::No,
            _ => hkv_aof::FsyncPolicy::EverySecond,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn aof_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.dir).join(&self.appendfilename)
    }

    /// Comma-separated `peers` parsed into individual `host:port` entries,
    /// blanks dropped.
    pub fn peer_list(&self) -> Vec<String> {
        self.peers.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = Config::parse("port = 7000\nnonsense = true\n").unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.bind, "127.0.0.1");
    }

    #[test]
    fn self_field_is_renamed_from_a_reserved_word() {
        let cfg = Config::parse("self = \"10.0.0.1:7000\"\n").unwrap();
        assert_eq!(cfg.self_addr.as_deref(), Some("10.0.0.1:7000"));
    }

    #[test]
    fn peer_list_splits_and_trims() {
        let cfg = Config::parse("peers = \"a:1, b:2 ,  c:3\"\n").unwrap();
        assert_eq!(cfg.peer_list(), vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn fsync_policy_defaults_to_everysec() {
        let cfg = Config::default();
        assert_eq!(cfg.fsync_policy(), hkv_aof::FsyncPolicy::EverySecond);
    }
}
