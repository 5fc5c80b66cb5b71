pub mod settings;

pub use settings::{load_protocols, Settings};
