use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::rules::rule::Rule;
use crate::rules::store::RuleStore;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read rules file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("rules file {0} is not valid JSON: {1}")]
    Json(String, #[source] serde_json::Error),
}

#[derive(Deserialize)]
struct RulesFile {
    rules: Vec<serde_json::Value>,
}

/// Loads the rules file into the store. Each entry is deserialized on its
/// own so one malformed rule is skipped while the rest load; duplicates and
/// unconfigured protocols are skipped likewise. Returns how many rules
/// loaded cleanly.
pub fn load_rules(path: &Path, store: &mut RuleStore) -> Result<usize, ParseError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ParseError::Io(path.display().to_string(), e))?;
    let file: RulesFile = serde_json::from_str(&text)
        .map_err(|e| ParseError::Json(path.display().to_string(), e))?;

    let mut loaded = 0;
    for raw in file.rules {
        let rule: Rule = match serde_json::from_value(raw) {
            Ok(rule) => rule,
            Err(e) => {
                error!("skipping malformed rule: {}", e);
                continue;
            }
        };
        debug!("loaded rule {} ({})", rule.rule_id, rule.protocol);
        match store.insert(Arc::new(rule)) {
            Ok(()) => loaded += 1,
            Err(e) => warn!("skipping rule: {}", e),
        }
    }
    Ok(loaded)
}
