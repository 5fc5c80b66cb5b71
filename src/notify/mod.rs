pub mod aggregator;

pub use aggregator::{
    aggregate, BatchItem, Event, EventKind, HttpSink, NotificationManager, NotificationSink,
    NotifyError,
};
