use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use crate::analysis::history::SourceHistory;
use crate::capture::packet::{self, PacketView};
use crate::capture::queue::PacketQueue;
use crate::config::settings::Settings;
use crate::firewall::blocker::{Blacklist, Blocker};
use crate::notify::aggregator::{Event, EventKind, NotificationManager};
use crate::rules::rule::{Rule, RuleAction};
use crate::rules::store::RuleStore;
use crate::service::stop::StopFlag;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumer half of the pipeline. Pulls raw frames off the packet queue,
/// classifies them, walks the candidate rules and dispatches the configured
/// actions. Per-packet failures never leave this loop.
pub struct PacketAnalyzer {
    queue: Arc<PacketQueue>,
    store: Arc<RuleStore>,
    settings: Arc<Settings>,
    notifier: Arc<NotificationManager>,
    blocker: Arc<dyn Blocker>,
    blacklist: Arc<Blacklist>,
    history: SourceHistory,
}

impl PacketAnalyzer {
    pub fn new(
        queue: Arc<PacketQueue>,
        store: Arc<RuleStore>,
        settings: Arc<Settings>,
        notifier: Arc<NotificationManager>,
        blocker: Arc<dyn Blocker>,
        blacklist: Arc<Blacklist>,
    ) -> Self {
        let history = SourceHistory::new(store.max_threshold_window());
        Self {
            queue,
            store,
            settings,
            notifier,
            blocker,
            blacklist,
            history,
        }
    }

    /// Runs until the stop flag is set and the queue has been drained.
    pub fn run(&mut self, stop: &StopFlag) {
        info!("packet analysis started");
        loop {
            match self.queue.pop_timeout(POLL_TIMEOUT) {
                Some(frame) => self.analyze_frame(&frame),
                None => {
                    if stop.is_set() && self.queue.is_empty() {
                        break;
                    }
                    debug!("packet queue empty");
                }
            }
        }
        info!("packet analysis stopped");
    }

    fn analyze_frame(&mut self, frame: &[u8]) {
        match packet::from_ethernet(frame) {
            Some(view) => self.analyze(&view),
            None => warn!(
                "discarding packet without IPv4 or IPv6 layer ({} bytes)",
                frame.len()
            ),
        }
    }

    /// Runs the rule pipeline for one extracted packet: protocol lookup,
    /// then for each candidate the direction pre-filter, the rule predicate
    /// and the zone gate. Every matching rule dispatches; there is no
    /// short-circuit on the first match.
    pub fn analyze(&mut self, view: &PacketView) {
        let protocol = packet::protocol_name(view.protocol);
        debug!("packet protocol identified: {}", protocol);

        let candidates = self.store.lookup(&protocol, &view.src_ip);
        if candidates.is_empty() {
            debug!("no rules for {} packet from {}", protocol, view.src_ip);
            return;
        }

        let now = unix_now();
        for rule in candidates {
            debug!("checking rule {} against {}", rule.rule_id, view.summary);
            if !self
                .settings
                .direction_allows(rule.direction, &view.src_ip, &view.dst_ip)
            {
                debug!("rule {}: direction filter rejected packet", rule.rule_id);
                continue;
            }
            if !rule.matches(view, &mut self.history, now) {
                continue;
            }
            // Matches from outside both configured zones are only acted on
            // by explicit wildcard rules.
            if rule.src_ip != "any" && !self.settings.in_any_zone(&view.src_ip) {
                debug!(
                    "rule {}: source {} outside configured zones",
                    rule.rule_id, view.src_ip
                );
                continue;
            }
            self.dispatch(&rule, view, now);
        }
    }

    fn dispatch(&mut self, rule: &Rule, view: &PacketView, now: u64) {
        match rule.action {
            RuleAction::Alert => {
                warn!("alert: {} for packet {}", rule.description, view.summary);
                self.notifier.push(make_event(
                    rule,
                    EventKind::Alert,
                    rule.description.clone(),
                    view,
                    now,
                ));
            }
            RuleAction::Block => {
                info!("blocking: {} for packet {}", rule.description, view.summary);
                self.notifier.push(make_event(
                    rule,
                    EventKind::Block,
                    format!("{} (blocked)", rule.description),
                    view,
                    now,
                ));
                self.block_source(&view.src_ip);
            }
            RuleAction::Log => {
                debug!(
                    "rule {} matched without action: {}",
                    rule.rule_id, view.summary
                );
            }
        }
    }

    /// Installs a kernel drop for the source. A source already blacklisted
    /// gets its drop removed first so repeat blocks replace instead of
    /// stacking.
    fn block_source(&mut self, src_ip: &str) {
        let host = strip_port(src_ip);
        if self.blacklist.contains(host) {
            match self.blocker.remove_drop(host) {
                Ok(()) => self.blacklist.remove(host),
                Err(e) => error!("could not remove existing drop for {}: {}", host, e),
            }
        }
        match self.blocker.install_drop(host) {
            Ok(()) => self.blacklist.insert(host),
            Err(e) => error!("could not install drop for {}: {}", host, e),
        }
    }
}

/// Reduces a `host:port` form to the host part; addresses with zero or
/// several colons (IPv6) pass through untouched.
fn strip_port(addr: &str) -> &str {
    match addr.matches(':').count() {
        1 => addr.split(':').next().unwrap_or(addr),
        _ => addr,
    }
}

fn make_event(
    rule: &Rule,
    kind: EventKind,
    description: String,
    view: &PacketView,
    now: u64,
) -> Event {
    Event {
        rule_id: rule.rule_id.clone(),
        kind,
        description,
        packet_summary: view.summary.clone(),
        timestamp: now,
        src_ip: view.src_ip.clone(),
        dst_ip: view.dst_ip.clone(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::packet::build;
    use crate::firewall::blocker::FirewallError;
    use crate::notify::aggregator::{aggregate, BatchItem, NotificationSink, NotifyError};
    use std::sync::Mutex;

    struct RecordingBlocker {
        installed: Mutex<Vec<String>>,
    }

    impl RecordingBlocker {
        fn new() -> Self {
            Self {
                installed: Mutex::new(Vec::new()),
            }
        }

        fn drops(&self) -> Vec<String> {
            self.installed.lock().unwrap().clone()
        }
    }

    impl Blocker for RecordingBlocker {
        fn install_drop(&self, ip: &str) -> Result<(), FirewallError> {
            self.installed.lock().unwrap().push(ip.to_string());
            Ok(())
        }

        fn remove_drop(&self, ip: &str) -> Result<(), FirewallError> {
            let mut installed = self.installed.lock().unwrap();
            if let Some(pos) = installed.iter().position(|entry| entry == ip) {
                installed.remove(pos);
            }
            Ok(())
        }

        fn clear_all_drops(&self) -> Result<(), FirewallError> {
            self.installed.lock().unwrap().clear();
            Ok(())
        }
    }

    struct NullSink;

    impl NotificationSink for NullSink {
        fn deliver(&self, _batch: &[BatchItem]) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    struct Harness {
        analyzer: PacketAnalyzer,
        queue: Arc<PacketQueue>,
        notifier: Arc<NotificationManager>,
        blocker: Arc<RecordingBlocker>,
        blacklist: Arc<Blacklist>,
    }

    fn harness(rules_json: &str) -> Harness {
        let mut store = RuleStore::with_protocols(&[
            "TCP".to_string(),
            "UDP".to_string(),
            "ICMP".to_string(),
        ]);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(rules_json).unwrap();
        for raw in parsed {
            let rule: Rule = serde_json::from_value(raw).unwrap();
            store.insert(Arc::new(rule)).unwrap();
        }

        let settings = Arc::new(Settings::new(
            "192.168.1.0/24",
            "!192.168.1.0/24,0.0.0.0/0",
        ));
        let queue = Arc::new(PacketQueue::new(128));
        let notifier = Arc::new(NotificationManager::new(
            Arc::new(NullSink),
            Duration::from_secs(100),
            100_000,
        ));
        let blocker = Arc::new(RecordingBlocker::new());
        let blacklist = Arc::new(Blacklist::new());

        let shared: Arc<dyn Blocker> = blocker.clone();
        let analyzer = PacketAnalyzer::new(
            queue.clone(),
            Arc::new(store),
            settings,
            notifier.clone(),
            shared,
            blacklist.clone(),
        );

        Harness {
            analyzer,
            queue,
            notifier,
            blocker,
            blacklist,
        }
    }

    #[test]
    fn test_alert_fires_on_second_packet_within_window() {
        let mut h = harness(
            r#"[{"rule_id": "R1", "protocol": "TCP", "dst_port": 80,
                 "action": "alert", "description": "http probe",
                 "direction": "both", "threshold": {"count": 1, "time": 10}}]"#,
        );
        let frame = build::tcp_frame("10.0.0.5", "192.168.1.2", 1234, 80, 0x02);

        h.analyzer.analyze_frame(&frame);
        assert_eq!(h.notifier.pending(), 0);

        h.analyzer.analyze_frame(&frame);
        assert_eq!(h.notifier.pending(), 1);

        let batch = aggregate(h.notifier.drain_batch());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].rule_id, "R1");
        assert_eq!(batch[0].total_events, 1);
        assert_eq!(batch[0].unique_src_ips, vec!["10.0.0.5".to_string()]);
        assert_eq!(batch[0].unique_dst_ips, vec!["192.168.1.2".to_string()]);
    }

    #[test]
    fn test_direction_in_rejects_outbound() {
        let rules = r#"[{"rule_id": "R1", "protocol": "TCP", "action": "alert",
                         "direction": "in", "threshold": {"count": 0, "time": 10}}]"#;
        let mut h = harness(rules);

        // home -> external does not match an "in" rule.
        let outbound = build::tcp_frame("192.168.1.2", "10.0.0.5", 1234, 80, 0x02);
        h.analyzer.analyze_frame(&outbound);
        assert_eq!(h.notifier.pending(), 0);

        // external -> home does.
        let inbound = build::tcp_frame("10.0.0.5", "192.168.1.2", 1234, 80, 0x02);
        h.analyzer.analyze_frame(&inbound);
        assert_eq!(h.notifier.pending(), 1);
    }

    #[test]
    fn test_block_replaces_instead_of_stacking() {
        let mut h = harness(
            r#"[{"rule_id": "B1", "protocol": "TCP", "src_ip": "10.0.0.9",
                 "action": "block", "description": "scanner",
                 "threshold": {"count": 0, "time": 10}}]"#,
        );
        let frame = build::tcp_frame("10.0.0.9", "192.168.1.2", 4444, 22, 0x02);

        h.analyzer.analyze_frame(&frame);
        h.analyzer.analyze_frame(&frame);

        // The second match removed the first drop before reinstalling.
        assert_eq!(h.blocker.drops(), vec!["10.0.0.9".to_string()]);
        assert!(h.blacklist.contains("10.0.0.9"));
        assert_eq!(h.blacklist.len(), 1);
        assert_eq!(h.notifier.pending(), 2);

        let batch = aggregate(h.notifier.drain_batch());
        assert_eq!(batch[0].description, "scanner (blocked)");
    }

    #[test]
    fn test_all_matching_rules_fire() {
        let mut h = harness(
            r#"[{"rule_id": "R1", "protocol": "TCP", "dst_port": 80,
                 "action": "alert", "threshold": {"count": 0, "time": 10}},
                {"rule_id": "R2", "protocol": "TCP",
                 "action": "alert", "threshold": {"count": 0, "time": 10}}]"#,
        );
        let frame = build::tcp_frame("10.0.0.5", "192.168.1.2", 1234, 80, 0x02);

        // No short-circuit: one packet dispatches both matching rules.
        h.analyzer.analyze_frame(&frame);
        assert_eq!(h.notifier.pending(), 2);
    }

    #[test]
    fn test_source_outside_zones_needs_wildcard_rule() {
        // HOME_NET 192.168.1.0/24, EXTERNAL_NET covers only 10/8.
        let mut store = RuleStore::with_protocols(&["TCP".to_string()]);
        let literal: Rule = serde_json::from_str(
            r#"{"rule_id": "R1", "protocol": "TCP", "src_ip": "172.16.0.9",
                "action": "alert", "threshold": {"count": 0, "time": 10}}"#,
        )
        .unwrap();
        store.insert(Arc::new(literal)).unwrap();

        let settings = Arc::new(Settings::new("192.168.1.0/24", "10.0.0.0/8"));
        let queue = Arc::new(PacketQueue::new(16));
        let notifier = Arc::new(NotificationManager::new(
            Arc::new(NullSink),
            Duration::from_secs(100),
            100_000,
        ));
        let blocker: Arc<dyn Blocker> = Arc::new(RecordingBlocker::new());
        let mut analyzer = PacketAnalyzer::new(
            queue,
            Arc::new(store),
            settings,
            notifier.clone(),
            blocker,
            Arc::new(Blacklist::new()),
        );

        // 172.16.0.9 is in neither zone; the direction filter already
        // rejects it, and the final gate would too.
        let frame = build::tcp_frame("172.16.0.9", "192.168.1.2", 1234, 80, 0x02);
        analyzer.analyze_frame(&frame);
        assert_eq!(notifier.pending(), 0);
    }

    #[test]
    fn test_packet_without_rules_is_ignored() {
        let mut h = harness(r#"[]"#);
        let frame = build::udp_frame("10.0.0.5", "192.168.1.2", 5353, 53);
        h.analyzer.analyze_frame(&frame);
        assert_eq!(h.notifier.pending(), 0);
    }

    #[test]
    fn test_non_ip_frame_discarded() {
        let mut h = harness(r#"[]"#);
        h.analyzer.analyze_frame(&[0u8; 30]);
        assert_eq!(h.notifier.pending(), 0);
    }

    #[test]
    fn test_stop_drains_queue_before_exit() {
        let mut h = harness(
            r#"[{"rule_id": "R1", "protocol": "TCP", "action": "alert",
                 "threshold": {"count": 0, "time": 10}}]"#,
        );
        for _ in 0..50 {
            h.queue
                .push(build::tcp_frame("10.0.0.5", "192.168.1.2", 1234, 80, 0x02));
        }

        let stop = StopFlag::new();
        stop.set();
        h.analyzer.run(&stop);

        assert!(h.queue.is_empty());
        assert_eq!(h.notifier.pending(), 50);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("10.0.0.9"), "10.0.0.9");
        assert_eq!(strip_port("10.0.0.9:443"), "10.0.0.9");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }
}
