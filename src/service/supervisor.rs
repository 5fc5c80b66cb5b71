use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use log::{error, info, warn};

use crate::analysis::analyzer::PacketAnalyzer;
use crate::capture::queue::PacketQueue;
use crate::capture::sniffer::PacketSniffer;
use crate::config::settings::{self, Settings};
use crate::firewall::blocker::{Blacklist, Blocker, IptablesBlocker};
use crate::notify::aggregator::{
    HttpSink, NotificationManager, DEFAULT_BUFFER_TIME, DEFAULT_ENDPOINT,
    DEFAULT_MAX_NOTIFICATIONS,
};
use crate::rules::parser;
use crate::rules::store::RuleStore;
use crate::service::stop::StopFlag;

pub const PACKET_QUEUE_CAPACITY: usize = 512;

/// Owns the pipeline lifecycle: loads configuration, wires the capture,
/// analysis and notification workers around the shared queues and stop
/// flag, and clears installed firewall drops on the way out.
pub struct ServiceManager {
    interface: String,
    settings: Arc<Settings>,
    store: Arc<RuleStore>,
    stop: Arc<StopFlag>,
}

impl ServiceManager {
    pub fn new(interface: &str, rules_path: &Path, home_net: Option<&str>) -> Self {
        let protocols = settings::load_protocols(Path::new(settings::PROTOCOLS_CONFIG));
        let settings = Settings::load(Path::new(settings::SETTINGS_CONFIG), home_net);

        let mut store = RuleStore::with_protocols(&protocols);
        match parser::load_rules(rules_path, &mut store) {
            Ok(loaded) => info!("{} rules loaded from {}", loaded, rules_path.display()),
            Err(e) => warn!("starting without rules: {}", e),
        }

        Self {
            interface: interface.to_string(),
            settings: Arc::new(settings),
            store: Arc::new(store),
            stop: Arc::new(StopFlag::new()),
        }
    }

    /// Runs the service until a termination signal arrives. Capture setup
    /// failures abort startup; everything after that is handled by the
    /// workers themselves.
    pub fn start(&self) -> Result<()> {
        let queue = Arc::new(PacketQueue::new(PACKET_QUEUE_CAPACITY));
        let sniffer = PacketSniffer::open(&self.interface, queue.clone())
            .with_context(|| format!("cannot capture on interface {}", self.interface))?;

        let blocker: Arc<dyn Blocker> = Arc::new(IptablesBlocker::new());
        let blacklist = Arc::new(Blacklist::new());
        let sink = Arc::new(HttpSink::new(DEFAULT_ENDPOINT).context("notification sink setup")?);
        let notifier = Arc::new(NotificationManager::new(
            sink,
            DEFAULT_BUFFER_TIME,
            DEFAULT_MAX_NOTIFICATIONS,
        ));

        {
            let stop = self.stop.clone();
            ctrlc::set_handler(move || {
                info!("termination signal received, stopping service");
                stop.set();
            })
            .context("failed to install signal handler")?;
        }

        let capture_thread = {
            let stop = self.stop.clone();
            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || sniffer.run(&stop))
                .context("failed to spawn capture worker")?
        };

        let analyzer_thread = {
            let mut analyzer = PacketAnalyzer::new(
                queue.clone(),
                self.store.clone(),
                self.settings.clone(),
                notifier.clone(),
                blocker.clone(),
                blacklist.clone(),
            );
            let stop = self.stop.clone();
            thread::Builder::new()
                .name("analyzer".to_string())
                .spawn(move || analyzer.run(&stop))
                .context("failed to spawn analyzer worker")?
        };

        let notifier_thread = {
            let notifier = notifier.clone();
            let stop = self.stop.clone();
            thread::Builder::new()
                .name("notifier".to_string())
                .spawn(move || notifier.run(&stop))
                .context("failed to spawn notification worker")?
        };

        info!(
            "service started on {} with {} rules",
            self.interface,
            self.store.rule_count()
        );

        for (name, handle) in [
            ("capture", capture_thread),
            ("analyzer", analyzer_thread),
            ("notifier", notifier_thread),
        ] {
            if handle.join().is_err() {
                error!("{} worker panicked", name);
            }
        }

        if !blacklist.is_empty() {
            info!("clearing {} firewall drops", blacklist.len());
        }
        if let Err(e) = blocker.clear_all_drops() {
            error!("failed to clear firewall drops: {}", e);
        }

        info!("service stopped");
        Ok(())
    }
}
