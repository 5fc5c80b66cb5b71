pub mod parser;
pub mod rule;
pub mod store;

pub use parser::load_rules;
pub use rule::{Direction, PortSpec, Rule, RuleAction, Threshold};
pub use store::{PrefixTrie, RuleStore, StoreError};
