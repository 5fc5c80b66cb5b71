pub mod analyzer;
pub mod history;

pub use analyzer::PacketAnalyzer;
pub use history::SourceHistory;
