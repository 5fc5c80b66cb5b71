use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::rules::rule::Rule;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate rule id '{0}' for protocol {1}")]
    DuplicateRuleId(String, String),

    #[error("protocol '{0}' is not configured")]
    UnknownProtocol(String),

    #[error("rule has an empty rule_id")]
    EmptyRuleId,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    rules: Vec<Arc<Rule>>,
}

/// Character-level prefix trie keyed on rule `src_ip` strings. Each node
/// holds the rules whose stored key ends there; insertion order within a
/// node is preserved.
pub struct PrefixTrie {
    root: TrieNode,
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
        }
    }

    pub fn insert(&mut self, key: &str, rule: Arc<Rule>) {
        let mut node = &mut self.root;
        for ch in key.chars() {
            node = node.children.entry(ch).or_default();
        }
        node.rules.push(rule);
    }

    /// Walks the trie along the query string, collecting the rules at every
    /// visited node -- i.e. every rule whose stored key is a character-wise
    /// prefix of the query. The walk stops at the first missing node.
    /// Wildcard rules gathered from the whole tree are appended, and the
    /// result is deduplicated by rule id so a rule is returned at most once.
    pub fn lookup(&self, key: &str) -> Vec<Arc<Rule>> {
        let mut found: Vec<Arc<Rule>> = Vec::new();
        let mut node = &self.root;
        found.extend(node.rules.iter().cloned());
        for ch in key.chars() {
            match node.children.get(&ch) {
                Some(next) => {
                    node = next;
                    found.extend(node.rules.iter().cloned());
                }
                None => {
                    debug!("no trie node for prefix ending in '{}', falling back to wildcards", ch);
                    break;
                }
            }
        }

        Self::collect_wildcards(&self.root, &mut found);

        let mut seen: HashSet<String> = HashSet::new();
        let mut result = Vec::with_capacity(found.len());
        for rule in found {
            if seen.insert(rule.rule_id.clone()) {
                result.push(rule);
            }
        }
        result
    }

    fn collect_wildcards(node: &TrieNode, out: &mut Vec<Arc<Rule>>) {
        for rule in &node.rules {
            if rule.is_wildcard() {
                out.push(rule.clone());
            }
        }
        for child in node.children.values() {
            Self::collect_wildcards(child, out);
        }
    }
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol-partitioned rule index. Lookups for protocols without a
/// partition are a cheap miss.
pub struct RuleStore {
    partitions: HashMap<String, PrefixTrie>,
    rule_ids: HashMap<String, HashSet<String>>,
    rule_count: usize,
    max_threshold_window: u64,
}

impl RuleStore {
    pub fn with_protocols(protocols: &[String]) -> Self {
        let mut partitions = HashMap::new();
        for protocol in protocols {
            partitions.insert(protocol.clone(), PrefixTrie::new());
            debug!("protocol {} registered", protocol);
        }
        Self {
            partitions,
            rule_ids: HashMap::new(),
            rule_count: 0,
            max_threshold_window: crate::rules::rule::DEFAULT_THRESHOLD_TIME,
        }
    }

    /// Inserts a rule under its protocol partition, keyed on its `src_ip`
    /// string. Rule ids must be unique within a partition.
    pub fn insert(&mut self, rule: Arc<Rule>) -> Result<(), StoreError> {
        if rule.rule_id.is_empty() {
            return Err(StoreError::EmptyRuleId);
        }
        let Some(trie) = self.partitions.get_mut(&rule.protocol) else {
            return Err(StoreError::UnknownProtocol(rule.protocol.clone()));
        };
        let ids = self.rule_ids.entry(rule.protocol.clone()).or_default();
        if !ids.insert(rule.rule_id.clone()) {
            return Err(StoreError::DuplicateRuleId(
                rule.rule_id.clone(),
                rule.protocol.clone(),
            ));
        }

        self.max_threshold_window = self.max_threshold_window.max(rule.threshold.time);
        let key = rule.src_ip.clone();
        trie.insert(&key, rule);
        self.rule_count += 1;
        Ok(())
    }

    pub fn lookup(&self, protocol: &str, src_ip: &str) -> Vec<Arc<Rule>> {
        match self.partitions.get(protocol) {
            Some(trie) => trie.lookup(src_ip),
            None => {
                warn!("protocol {} not supported, no rules apply", protocol);
                Vec::new()
            }
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// Longest threshold window of any loaded rule, used to bound the
    /// per-source history retention.
    pub fn max_threshold_window(&self) -> u64 {
        self.max_threshold_window
    }
}
