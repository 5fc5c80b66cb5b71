pub mod blocker;

pub use blocker::{Blacklist, Blocker, FirewallError, IptablesBlocker};
