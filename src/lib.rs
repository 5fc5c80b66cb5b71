// Library exports for openwrt-ids-ips
pub mod analysis;
pub mod capture;
pub mod config;
pub mod firewall;
pub mod notify;
pub mod rules;
pub mod service;
pub mod utils;

pub use analysis::{analyzer, history};
pub use capture::{packet, queue, sniffer};
pub use config::settings;
pub use notify::aggregator;
pub use rules::{parser, store};
pub use service::supervisor;

// Error types
pub use anyhow::{Error, Result};
