use log::debug;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::analysis::history::SourceHistory;
use crate::capture::packet::PacketView;

pub const DEFAULT_THRESHOLD_COUNT: u32 = 1;
pub const DEFAULT_THRESHOLD_TIME: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Alert,
    Block,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    #[default]
    Both,
}

/// A port constraint: either a concrete port number or the wildcard "any".
/// Accepts both JSON numbers and the string `"any"` in rule files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSpec {
    #[default]
    Any,
    Port(u16),
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(port) => Ok(PortSpec::Port(port)),
            Raw::Text(text) if text == "any" => Ok(PortSpec::Any),
            Raw::Text(text) => text
                .parse::<u16>()
                .map(PortSpec::Port)
                .map_err(|_| de::Error::custom(format!("invalid port value '{}'", text))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Threshold {
    #[serde(default = "default_threshold_count")]
    pub count: u32,
    #[serde(default = "default_threshold_time")]
    pub time: u64,
}

impl Default for Threshold {
    fn default() -> Self {
        Self {
            count: DEFAULT_THRESHOLD_COUNT,
            time: DEFAULT_THRESHOLD_TIME,
        }
    }
}

fn default_threshold_count() -> u32 {
    DEFAULT_THRESHOLD_COUNT
}

fn default_threshold_time() -> u64 {
    DEFAULT_THRESHOLD_TIME
}

fn any_endpoint() -> String {
    "any".to_string()
}

/// A single detection rule as loaded from the rules file. Immutable after
/// parse; shared across the pipeline behind an `Arc`.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub protocol: String,
    #[serde(default = "any_endpoint")]
    pub src_ip: String,
    #[serde(default = "any_endpoint")]
    pub dst_ip: String,
    #[serde(default)]
    pub src_port: PortSpec,
    #[serde(default)]
    pub dst_port: PortSpec,
    pub action: RuleAction,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub threshold: Threshold,
}

impl Rule {
    /// A rule counts as a wildcard when any of its endpoints is "any".
    pub fn is_wildcard(&self) -> bool {
        self.src_ip == "any"
            || self.dst_ip == "any"
            || self.src_port == PortSpec::Any
            || self.dst_port == PortSpec::Any
    }

    /// Evaluates the rule against a packet. Port constraints only apply to
    /// TCP packets; flag constraints require a TCP layer outright. The last
    /// step records the packet in the per-source history and enforces the
    /// sliding-window threshold: the match fires only once the window holds
    /// strictly more than `threshold.count` entries. Mutating the history
    /// is the only side effect.
    pub fn matches(&self, packet: &PacketView, history: &mut SourceHistory, now: u64) -> bool {
        if self.src_ip != "any" && packet.src_ip != self.src_ip {
            debug!(
                "rule {}: src {} does not match {}",
                self.rule_id, packet.src_ip, self.src_ip
            );
            return false;
        }

        if self.dst_ip != "any" && packet.dst_ip != self.dst_ip {
            debug!(
                "rule {}: dst {} does not match {}",
                self.rule_id, packet.dst_ip, self.dst_ip
            );
            return false;
        }

        if let PortSpec::Port(port) = self.src_port {
            if packet.is_tcp() && packet.src_port != Some(port) {
                debug!("rule {}: src port mismatch", self.rule_id);
                return false;
            }
        }

        if let PortSpec::Port(port) = self.dst_port {
            if packet.is_tcp() && packet.dst_port != Some(port) {
                debug!("rule {}: dst port mismatch", self.rule_id);
                return false;
            }
        }

        if !self.flags.is_empty() {
            let Some(flags) = packet.tcp_flags.as_deref() else {
                debug!("rule {}: flags required but packet has no TCP layer", self.rule_id);
                return false;
            };
            for letter in &self.flags {
                if !flags.contains(letter.as_str()) {
                    debug!("rule {}: packet lacks TCP flag {}", self.rule_id, letter);
                    return false;
                }
            }
        }

        let hits = history.record(&packet.src_ip, now);
        let cutoff = now.saturating_sub(self.threshold.time);
        hits.retain(|ts| *ts > cutoff);
        hits.len() as u64 > u64::from(self.threshold.count)
    }
}
