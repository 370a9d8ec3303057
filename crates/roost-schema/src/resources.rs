//! Requested container limits, passed through to the engine after validation.

use crate::instance::RecordError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Docker refuses memory limits below 6 MiB.
const MIN_MEMORY_MB: u64 = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.container, self.protocol)
    }
}

impl FromStr for PortMapping {
    type Err = RecordError;

    /// Parses `host:container` or `host:container/proto`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || {
            RecordError::InvalidSpec(format!(
                "invalid port mapping '{s}', expected '<host>:<container>[/tcp|udp]'"
            ))
        };
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(bad()),
            None => (s, Protocol::Tcp),
        };
        let (host, container) = ports.split_once(':').ok_or_else(bad)?;
        Ok(PortMapping {
            host: host.trim().parse().map_err(|_| bad())?,
            container: container.trim().parse().map_err(|_| bad())?,
            protocol,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub image: String,
    /// CPU limit in thousandths of a core (`500` = half a core).
    #[serde(default)]
    pub cpu_millis: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ResourceSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cpu_millis: None,
            memory_mb: None,
            ports: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        let image = self.image.trim();
        if image.is_empty() {
            return Err(RecordError::InvalidSpec("image must not be empty".to_owned()));
        }
        if image.len() != self.image.len() || image.chars().any(char::is_whitespace) {
            return Err(RecordError::InvalidSpec(format!(
                "image '{}' contains whitespace",
                self.image
            )));
        }
        if self.cpu_millis == Some(0) {
            return Err(RecordError::InvalidSpec("cpu limit must be positive".to_owned()));
        }
        if let Some(mb) = self.memory_mb {
            if mb < MIN_MEMORY_MB {
                return Err(RecordError::InvalidSpec(format!(
                    "memory limit {mb}m is below the {MIN_MEMORY_MB}m minimum"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for port in &self.ports {
            if port.host == 0 || port.container == 0 {
                return Err(RecordError::InvalidSpec(format!(
                    "port mapping '{port}' uses port 0"
                )));
            }
            if !seen.insert((port.host, port.protocol)) {
                return Err(RecordError::InvalidSpec(format!(
                    "host port {}/{} mapped twice",
                    port.host, port.protocol
                )));
            }
        }

        for key in self.env.keys() {
            let mut bytes = key.bytes();
            let valid_head = bytes
                .next()
                .is_some_and(|b| b.is_ascii_alphabetic() || b == b'_');
            if !valid_head || !bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(RecordError::InvalidSpec(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// `--cpus` argument in the engine's decimal notation.
    pub fn cpus_arg(&self) -> Option<String> {
        self.cpu_millis
            .map(|m| format!("{}.{:03}", m / 1000, m % 1000))
    }
}

/// Parse a memory size such as `512m`, `2g` or `1024` (MiB) into MiB.
pub fn parse_memory(input: &str) -> Result<u64, RecordError> {
    let s = input.trim().to_ascii_lowercase();
    let bad = || RecordError::InvalidSpec(format!("invalid memory size '{input}'"));
    let (digits, factor) = if let Some(d) = s.strip_suffix("gb").or_else(|| s.strip_suffix('g')) {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix("mb").or_else(|| s.strip_suffix('m')) {
        (d, 1)
    } else {
        (s.as_str(), 1)
    };
    let value: u64 = digits.trim().parse().map_err(|_| bad())?;
    value.checked_mul(factor).ok_or_else(bad)
}

/// Parse a decimal CPU count such as `0.5` or `2` into millicores.
pub fn parse_cpus(input: &str) -> Result<u32, RecordError> {
    let bad = || RecordError::InvalidSpec(format!("invalid cpu count '{input}'"));
    let s = input.trim();
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if frac.len() > 3 || (whole.is_empty() && frac.is_empty()) {
        return Err(bad());
    }
    let whole: u32 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| bad())?
    };
    let frac_millis: u32 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<3}");
        padded.parse().map_err(|_| bad())?
    };
    whole
        .checked_mul(1000)
        .and_then(|m| m.checked_add(frac_millis))
        .ok_or_else(bad)
}
