use super::address;
use crate::protocol::ProtocolKind;
use crate::state::CacheLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid array configuration {config:?}: {reason}")]
    Array { config: String, reason: String },
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    #[error("invalid argument {arg:?} for protocol {protocol}: {reason}")]
    ProtocolArgument {
        protocol: ProtocolKind,
        arg: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unsupported configuration format {0:?} (expected yaml or json)")]
    Format(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A component description of the form `<NAME>:<key>=<value>:...`.
///
/// A key without value is a flag with the value `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl std::str::FromStr for Spec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Invalid(format!("{s:?} does not start with a name")))?;
        let params = parts
            .filter(|part| !part.trim().is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (part.trim().to_string(), "1".to_string()),
            })
            .collect();
        Ok(Self {
            name: name.to_string(),
            params,
        })
    }
}

impl std::fmt::Display for Spec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.params {
            write!(f, ":{key}={value}")?;
        }
        Ok(())
    }
}

impl Spec {
    /// Value of a parameter, keys compare case-insensitively.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse an unsigned integer in decimal, `0x` hex or leading-zero octal.
#[must_use]
pub fn parse_int(value: &str) -> Option<u64> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else if value.len() > 1 && value.starts_with('0') {
        u64::from_str_radix(&value[1..], 8).ok()
    } else {
        value.parse().ok()
    }
}

#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Bucket hashing of a tagless directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hasher {
    /// Hash functions: `simple`, `xor:<shift>` or `shift:<n>`.
    pub functions: Vec<String>,
    pub initial_shift: u32,
    pub buckets_per_hash: u32,
    /// Every function hashes into its own range of buckets.
    pub partitioned: bool,
}

impl Default for Hasher {
    fn default() -> Self {
        Self {
            functions: vec!["simple".to_string(), "xor:20".to_string()],
            initial_shift: 12,
            buckets_per_hash: 256,
            partitioned: true,
        }
    }
}

/// Configuration of one cache controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub name: String,
    pub level: CacheLevel,
    pub node_id: usize,
    /// Number of cores (front side ports) sharing this cache.
    pub cores: usize,
    pub block_size: u64,
    /// Array description, e.g. `STD:size=65536:assoc=8:repl=lru`.
    pub array: String,
    /// Protocol and its arguments, e.g. `InclusiveMESI:evict_acks_required=1`.
    pub protocol: String,
    pub banks: usize,
    pub ports: usize,
    pub tag_latency: u64,
    pub tag_issue_latency: u64,
    pub data_latency: u64,
    pub data_issue_latency: u64,
    pub queue_size: usize,
    pub prequeue_size: usize,
    pub maf_size: usize,
    pub maf_targets_per_request: usize,
    pub eb_size: usize,
    pub sb_size: usize,
    pub probe_on_ifetch_miss: bool,
    pub do_clean_evictions: bool,
    pub writable_evicts_have_data: bool,
    pub allow_offchip_stream_fetch: bool,
    /// Send evictions on the snoop channel rather than the request channel.
    pub evict_on_snoop: bool,
    /// Send snoop replies on their own reply channel.
    pub use_reply_channel: bool,
    /// Block whose messages are logged at debug level.
    pub trace_address: Option<address>,
    /// Bucket hashing, required by the tagless protocol.
    pub directory: Option<Hasher>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            name: "L2".to_string(),
            level: CacheLevel::L2,
            node_id: 0,
            cores: 1,
            block_size: 64,
            array: "STD:size=65536:assoc=8:repl=lru".to_string(),
            protocol: "InclusiveMESI".to_string(),
            banks: 1,
            ports: 1,
            tag_latency: 2,
            tag_issue_latency: 1,
            data_latency: 4,
            data_issue_latency: 1,
            queue_size: 16,
            prequeue_size: 4,
            maf_size: 32,
            maf_targets_per_request: 0,
            eb_size: 16,
            sb_size: 16,
            probe_on_ifetch_miss: false,
            do_clean_evictions: false,
            writable_evicts_have_data: false,
            allow_offchip_stream_fetch: false,
            evict_on_snoop: true,
            use_reply_channel: false,
            trace_address: None,
            directory: None,
        }
    }
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let size = self
            .array
            .parse::<Spec>()
            .ok()
            .and_then(|spec| spec.get("size").and_then(parse_int))
            .map_or_else(
                || "?".to_string(),
                |size| human_bytes::human_bytes(size as f64),
            );
        write!(
            f,
            "{} {} ({size}, {} byte blocks, {} banks, {})",
            self.level, self.name, self.block_size, self.banks, self.protocol
        )
    }
}

impl Cache {
    /// Load a configuration from a YAML or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            other => return Err(Error::Format(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// The selected protocol and its arguments.
    pub fn protocol(&self) -> Result<(ProtocolKind, Vec<(String, String)>), Error> {
        let spec: Spec = self.protocol.parse()?;
        let kind = spec
            .name
            .parse()
            .map_err(|_| Error::UnknownProtocol(spec.name.clone()))?;
        Ok((kind, spec.params))
    }

    /// Check the parts of the configuration the controller relies on.
    pub fn validate(&self) -> Result<(), Error> {
        let positive = [
            ("cores", self.cores),
            ("banks", self.banks),
            ("ports", self.ports),
            ("queue_size", self.queue_size),
            ("prequeue_size", self.prequeue_size),
            ("maf_size", self.maf_size),
            ("eb_size", self.eb_size),
            ("sb_size", self.sb_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Invalid(format!("{name} must be positive")));
        }
        if self.tag_issue_latency == 0 || self.data_issue_latency == 0 {
            return Err(Error::Invalid(
                "issue latencies must be at least one cycle".to_string(),
            ));
        }
        if !self.block_size.is_power_of_two() {
            return Err(Error::Invalid(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.maf_targets_per_request != 0 {
            return Err(Error::Invalid(
                "maf_targets_per_request must be 0".to_string(),
            ));
        }
        self.protocol()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_bool, parse_int, Cache, Error, Spec};
    use crate::protocol::ProtocolKind;
    use color_eyre::eyre;

    #[test]
    fn test_default_is_valid() -> eyre::Result<()> {
        let config = Cache::default();
        config.validate()?;
        assert_eq!(config.protocol()?.0, ProtocolKind::InclusiveMesi);
        let display = config.to_string();
        assert!(display.starts_with("L2 L2 ("), "{display}");
        assert!(display.ends_with("64 byte blocks, 1 banks, InclusiveMESI)"), "{display}");
        Ok(())
    }

    #[test]
    fn test_parse_spec() -> eyre::Result<()> {
        let spec: Spec = "STD:size=1048576:assoc=16:repl=lru".parse()?;
        assert_eq!(spec.name, "STD");
        pretty_assertions_sorted::assert_eq!(
            spec.params,
            vec![
                ("size".to_string(), "1048576".to_string()),
                ("assoc".to_string(), "16".to_string()),
                ("repl".to_string(), "lru".to_string()),
            ]
        );
        assert_eq!(spec.get("ASSOC"), Some("16"));

        let flag: Spec = "InclusiveMESI:two_level_private".parse()?;
        assert_eq!(flag.get("two_level_private"), Some("1"));
        assert!(":size=1".parse::<Spec>().is_err());
        Ok(())
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_int("4096"), Some(4096));
        assert_eq!(parse_int("0x1000"), Some(4096));
        assert_eq!(parse_int("010"), Some(8));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("lots"), None);
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_yaml_overrides_defaults() -> eyre::Result<()> {
        let config: Cache = serde_yaml::from_str(
            "
name: L1d
level: L1
banks: 2
protocol: InclusiveMOESI:require_miss_notify=0
trace_address: 4096
",
        )?;
        config.validate()?;
        assert_eq!(config.banks, 2);
        assert_eq!(config.queue_size, Cache::default().queue_size);
        assert_eq!(config.trace_address, Some(4096));
        let (kind, args) = config.protocol()?;
        assert_eq!(kind, ProtocolKind::InclusiveMoesi);
        assert_eq!(args.len(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_configurations() {
        let config = Cache {
            maf_targets_per_request: 2,
            ..Cache::default()
        };
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));

        let config = Cache {
            protocol: "DirectoryMSI".to_string(),
            ..Cache::default()
        };
        assert!(matches!(config.validate(), Err(Error::UnknownProtocol(_))));

        let config = Cache {
            block_size: 48,
            ..Cache::default()
        };
        assert!(config.validate().is_err());
    }
}
