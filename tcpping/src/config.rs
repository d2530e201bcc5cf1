use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    args::Opts,
    error::PingError,
    wire::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE},
};

pub const DEFAULT_MPS: u32 = 1;
pub const DEFAULT_DURATION_SECS: u64 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Config {
    Pitcher(PitcherConfig),
    Catcher(CatcherConfig),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PitcherConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_mps")]
    pub mps: u32,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default = "default_duration", with = "secs")]
    pub duration: Duration,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub iface: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CatcherConfig {
    pub bind: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub iface: Option<String>,
}

impl PitcherConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            mps: DEFAULT_MPS,
            size: DEFAULT_PACKET_SIZE,
            duration: default_duration(),
            file: None,
            iface: None,
        }
    }

    /// Time between two probes, `round(1000 / mps)` ms but at least 1 ms.
    pub fn emit_interval(&self) -> Duration {
        let millis = (1000.0 / self.mps.max(1) as f64).round() as u64;
        Duration::from_millis(millis.max(1))
    }

    /// Rejects a zero rate or duration and brings the size back into range.
    pub fn validated(mut self) -> Result<Self, PingError> {
        if self.mps == 0 {
            return Err(PingError::Configuration(
                "mps must be at least 1".to_string(),
            ));
        }
        if self.duration.is_zero() {
            return Err(PingError::Configuration(
                "duration must be at least 1 second".to_string(),
            ));
        }
        self.size = clamp_size(self.size as i64);
        Ok(self)
    }
}

fn default_mps() -> u32 {
    DEFAULT_MPS
}

fn default_size() -> usize {
    DEFAULT_PACKET_SIZE
}

fn default_duration() -> Duration {
    Duration::from_secs(DEFAULT_DURATION_SECS)
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Sizes outside `[MIN_PACKET_SIZE, MAX_PACKET_SIZE]` fall back to the
/// default instead of being rejected.
pub fn clamp_size(size: i64) -> usize {
    if (MIN_PACKET_SIZE as i64..=MAX_PACKET_SIZE as i64).contains(&size) {
        size as usize
    } else {
        warn!(
            "size {} outside {}..={}, using {}",
            size, MIN_PACKET_SIZE, MAX_PACKET_SIZE, DEFAULT_PACKET_SIZE
        );
        DEFAULT_PACKET_SIZE
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PingError::Configuration(format!("reading {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| PingError::Configuration(e.to_string()))?;
        Ok(config.validated()?)
    }

    fn validated(self) -> Result<Config, PingError> {
        match self {
            Config::Pitcher(cfg) => Ok(Config::Pitcher(cfg.validated()?)),
            Config::Catcher(cfg) => Ok(Config::Catcher(cfg)),
        }
    }
}

impl TryFrom<Opts> for Config {
    type Error = PingError;

    fn try_from(opts: Opts) -> Result<Self, Self::Error> {
        match opts {
            Opts {
                pitcher: true,
                catcher: false,
                port: Some(port),
                bind: None,
                mps,
                size,
                duration,
                file,
                iface,
                mut hosts,
                ..
            } if hosts.len() == 1 => {
                let cfg = PitcherConfig {
                    host: hosts.remove(0),
                    port,
                    mps: mps.unwrap_or(DEFAULT_MPS),
                    size: match size {
                        Some(size) => clamp_size(size),
                        None => DEFAULT_PACKET_SIZE,
                    },
                    duration: duration
                        .map(Duration::from_secs)
                        .unwrap_or_else(default_duration),
                    file,
                    iface,
                };
                Ok(Config::Pitcher(cfg.validated()?))
            }
            Opts {
                pitcher: false,
                catcher: true,
                port: Some(port),
                bind: Some(bind),
                mps: None,
                size: None,
                duration: None,
                file: None,
                iface,
                ref hosts,
                ..
            } if hosts.is_empty() => Ok(Config::Catcher(CatcherConfig {
                bind,
                port,
                iface,
            })),
            _ => Err(PingError::Configuration(
                "expected either -p --port <PORT> <HOST> or -c --port <PORT> \
                 --bind <IP_ADDRESS>"
                    .to_string(),
            )),
        }
    }
}
