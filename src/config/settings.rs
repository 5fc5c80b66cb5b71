use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use ipnetwork::{IpNetwork, Ipv4Network};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::rules::rule::Direction;

pub const PROTOCOLS_CONFIG: &str = "./protocols/config_protocols.json";
pub const SETTINGS_CONFIG: &str = "./configuration/config_settings.json";

pub const DEFAULT_HOME_NET: &str = "192.168.1.0/24";
pub const DEFAULT_EXTERNAL_NET: &str = "!192.168.1.0/24,0.0.0.0/0";

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(rename = "HOME_NET", default = "default_home_net")]
    home_net: String,
    #[serde(rename = "EXTERNAL_NET", default = "default_external_net")]
    external_net: String,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            home_net: default_home_net(),
            external_net: default_external_net(),
        }
    }
}

fn default_home_net() -> String {
    DEFAULT_HOME_NET.to_string()
}

fn default_external_net() -> String {
    DEFAULT_EXTERNAL_NET.to_string()
}

#[derive(Deserialize)]
struct SettingsFile {
    settings: RawSettings,
}

#[derive(Deserialize)]
struct ProtocolsFile {
    protocols: Vec<String>,
}

/// Network zone settings. HOME_NET is a single IPv4 CIDR; EXTERNAL_NET is a
/// comma-separated list of CIDRs where a leading `!` marks an exclusion.
/// The expressions are compiled once at load; unparsable pieces are warned
/// about and classify nothing.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home_net: String,
    pub external_net: String,
    home: Option<Ipv4Network>,
    included: Vec<IpNetwork>,
    excluded: Vec<IpNetwork>,
}

impl Settings {
    pub fn new(home_net: &str, external_net: &str) -> Self {
        let home = match home_net.parse::<Ipv4Network>() {
            Ok(network) => Some(network),
            Err(e) => {
                warn!("unparsable HOME_NET '{}': {}", home_net, e);
                None
            }
        };

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for token in external_net.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (negated, text) = match token.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, token),
            };
            match text.parse::<IpNetwork>() {
                Ok(network) if negated => excluded.push(network),
                Ok(network) => included.push(network),
                Err(e) => warn!("unparsable EXTERNAL_NET entry '{}': {}", token, e),
            }
        }

        Self {
            home_net: home_net.to_string(),
            external_net: external_net.to_string(),
            home,
            included,
            excluded,
        }
    }

    /// Loads `config_settings.json`, falling back to defaults with a warning
    /// when the file is missing or malformed. A command-line HOME_NET
    /// override takes precedence over the file.
    pub fn load(path: &Path, home_net_override: Option<&str>) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<SettingsFile>(&text) {
                Ok(file) => file.settings,
                Err(e) => {
                    warn!(
                        "settings file {} is not valid JSON ({}), using defaults",
                        path.display(),
                        e
                    );
                    RawSettings::default()
                }
            },
            Err(e) => {
                warn!(
                    "settings file {} not readable ({}), using defaults",
                    path.display(),
                    e
                );
                RawSettings::default()
            }
        };

        let home_net = home_net_override.unwrap_or(&raw.home_net);
        info!(
            "zone settings: HOME_NET={} EXTERNAL_NET={}",
            home_net, raw.external_net
        );
        Self::new(home_net, &raw.external_net)
    }

    /// True when the address parses as IPv4 and lies inside HOME_NET.
    pub fn is_home(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return false;
        };
        self.home.is_some_and(|network| network.contains(addr))
    }

    /// Evaluates the EXTERNAL_NET expression: any inclusion hit wins, then
    /// exclusions, then false.
    pub fn is_external(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            debug!("unparsable address '{}' treated as non-external", ip);
            return false;
        };
        if self.included.iter().any(|network| network.contains(addr)) {
            return true;
        }
        if self.excluded.iter().any(|network| network.contains(addr)) {
            return false;
        }
        false
    }

    pub fn in_any_zone(&self, ip: &str) -> bool {
        self.is_home(ip) || self.is_external(ip)
    }

    /// Direction pre-filter applied before a rule is evaluated: "in" means
    /// external source to home destination, "out" the reverse, "both" either.
    pub fn direction_allows(&self, direction: Direction, src: &str, dst: &str) -> bool {
        match direction {
            Direction::In => self.is_external(src) && self.is_home(dst),
            Direction::Out => self.is_home(src) && self.is_external(dst),
            Direction::Both => {
                (self.is_external(src) && self.is_home(dst))
                    || (self.is_home(src) && self.is_external(dst))
            }
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DEFAULT_HOME_NET, DEFAULT_EXTERNAL_NET)
    }
}

/// Loads the protocol list from `config_protocols.json`; a missing or
/// malformed file yields the default set with a warning.
pub fn load_protocols(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<ProtocolsFile>(&text) {
            Ok(file) => {
                info!("protocols loaded from {}: {:?}", path.display(), file.protocols);
                file.protocols
            }
            Err(e) => {
                warn!(
                    "protocols file {} is not valid JSON ({}), using defaults",
                    path.display(),
                    e
                );
                default_protocols()
            }
        },
        Err(e) => {
            warn!(
                "protocols file {} not readable ({}), using defaults",
                path.display(),
                e
            );
            default_protocols()
        }
    }
}

pub fn default_protocols() -> Vec<String> {
    ["TCP", "UDP", "ICMP", "ICMPv6"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab_settings() -> Settings {
        Settings::new("192.168.1.0/24", "!192.168.1.0/24,0.0.0.0/0")
    }

    #[test]
    fn test_home_membership() {
        let settings = lab_settings();
        assert!(settings.is_home("192.168.1.2"));
        assert!(!settings.is_home("10.0.0.5"));
        assert!(!settings.is_home("not-an-ip"));
        assert!(!settings.is_home("2001:db8::1"));
    }

    #[test]
    fn test_external_inclusion_beats_exclusion() {
        // 0.0.0.0/0 includes everything; the HOME_NET exclusion never wins
        // because inclusions are scanned first.
        let settings = lab_settings();
        assert!(settings.is_external("10.0.0.5"));
        assert!(settings.is_external("192.168.1.2"));
    }

    #[test]
    fn test_external_exclusion_applies_without_inclusion_hit() {
        let settings = Settings::new("192.168.1.0/24", "10.0.0.0/8,!172.16.0.0/12");
        assert!(settings.is_external("10.1.2.3"));
        assert!(!settings.is_external("172.16.5.5"));
        assert!(!settings.is_external("8.8.8.8"));
    }

    #[test]
    fn test_unparsable_configuration_classifies_nothing() {
        let settings = Settings::new("bogus", "also-bogus");
        assert!(!settings.is_home("192.168.1.2"));
        assert!(!settings.is_external("10.0.0.5"));
    }

    #[test]
    fn test_direction_filter_in_and_out() {
        let settings = Settings::new("192.168.1.0/24", "10.0.0.0/8");
        // external -> home
        assert!(settings.direction_allows(Direction::In, "10.0.0.5", "192.168.1.2"));
        assert!(!settings.direction_allows(Direction::In, "192.168.1.2", "10.0.0.5"));
        // home -> external
        assert!(settings.direction_allows(Direction::Out, "192.168.1.2", "10.0.0.5"));
        assert!(!settings.direction_allows(Direction::Out, "10.0.0.5", "192.168.1.2"));
    }

    #[test]
    fn test_direction_filter_is_total() {
        let settings = Settings::new("192.168.1.0/24", "10.0.0.0/8");
        // home, external, and neither-zone addresses in every combination.
        let addresses = ["192.168.1.2", "10.0.0.5", "172.16.0.9"];
        for direction in [Direction::In, Direction::Out, Direction::Both] {
            for src in addresses {
                for dst in addresses {
                    let allowed = settings.direction_allows(direction, src, dst);
                    let expect_in = settings.is_external(src) && settings.is_home(dst);
                    let expect_out = settings.is_home(src) && settings.is_external(dst);
                    let expected = match direction {
                        Direction::In => expect_in,
                        Direction::Out => expect_out,
                        Direction::Both => expect_in || expect_out,
                    };
                    assert_eq!(allowed, expected, "{:?} {} -> {}", direction, src, dst);
                }
            }
        }
    }

    #[test]
    fn test_load_missing_files_fall_back_to_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json"), None);
        assert_eq!(settings.home_net, DEFAULT_HOME_NET);
        assert_eq!(settings.external_net, DEFAULT_EXTERNAL_NET);

        let protocols = load_protocols(Path::new("/nonexistent/protocols.json"));
        assert_eq!(protocols, default_protocols());
    }

    #[test]
    fn test_home_net_override_wins() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json"), Some("10.0.0.0/8"));
        assert!(settings.is_home("10.1.2.3"));
        assert!(!settings.is_home("192.168.1.2"));
    }
}
