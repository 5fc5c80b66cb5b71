use std::collections::HashSet;
use std::process::Command;
use std::sync::Mutex;

use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to run {0}: {1}")]
    CommandFailed(String, #[source] std::io::Error),

    #[error("{0} exited with {1}: {2}")]
    CommandStatus(String, std::process::ExitStatus, String),
}

/// Opaque binding to the kernel packet filter. Implementations install and
/// remove source-address drops; `clear_all_drops` removes everything this
/// process installed.
pub trait Blocker: Send + Sync {
    fn install_drop(&self, ip: &str) -> Result<(), FirewallError>;
    fn remove_drop(&self, ip: &str) -> Result<(), FirewallError>;
    fn clear_all_drops(&self) -> Result<(), FirewallError>;
}

/// Source addresses with a drop currently installed. Mutated by the
/// analyzer when a block rule fires; read by the supervisor at shutdown.
pub struct Blacklist {
    inner: Mutex<HashSet<String>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
        }
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.inner.lock().unwrap().contains(ip)
    }

    pub fn insert(&self, ip: &str) {
        self.inner.lock().unwrap().insert(ip.to_string());
    }

    pub fn remove(&self, ip: &str) {
        self.inner.lock().unwrap().remove(ip);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocker backed by the host `iptables`: each blocked source gets a DROP
/// on INPUT (as source) and on OUTPUT (as destination). Installed entries
/// are tracked so `clear_all_drops` can undo them at shutdown.
pub struct IptablesBlocker {
    installed: Mutex<HashSet<String>>,
}

impl IptablesBlocker {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(HashSet::new()),
        }
    }

    fn run(args: &[&str]) -> Result<(), FirewallError> {
        let rendered = format!("iptables {}", args.join(" "));
        let output = Command::new("iptables")
            .args(args)
            .output()
            .map_err(|e| FirewallError::CommandFailed(rendered.clone(), e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FirewallError::CommandStatus(rendered, output.status, stderr));
        }
        Ok(())
    }

    fn add_rules(ip: &str) -> Result<(), FirewallError> {
        Self::run(&["-I", "INPUT", "-s", ip, "-j", "DROP"])?;
        Self::run(&["-I", "OUTPUT", "-d", ip, "-j", "DROP"])?;
        Ok(())
    }

    fn del_rules(ip: &str) -> Result<(), FirewallError> {
        Self::run(&["-D", "INPUT", "-s", ip, "-j", "DROP"])?;
        Self::run(&["-D", "OUTPUT", "-d", ip, "-j", "DROP"])?;
        Ok(())
    }
}

impl Default for IptablesBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocker for IptablesBlocker {
    fn install_drop(&self, ip: &str) -> Result<(), FirewallError> {
        Self::add_rules(ip)?;
        self.installed.lock().unwrap().insert(ip.to_string());
        info!("firewall drop installed for {}", ip);
        Ok(())
    }

    fn remove_drop(&self, ip: &str) -> Result<(), FirewallError> {
        Self::del_rules(ip)?;
        self.installed.lock().unwrap().remove(ip);
        info!("firewall drop removed for {}", ip);
        Ok(())
    }

    fn clear_all_drops(&self) -> Result<(), FirewallError> {
        let installed: Vec<String> = self.installed.lock().unwrap().iter().cloned().collect();
        for ip in installed {
            match Self::del_rules(&ip) {
                Ok(()) => {
                    self.installed.lock().unwrap().remove(&ip);
                }
                Err(e) => warn!("could not remove drop for {}: {}", ip, e),
            }
        }
        Ok(())
    }
}
