pub mod stop;
pub mod supervisor;

pub use stop::StopFlag;
pub use supervisor::ServiceManager;
