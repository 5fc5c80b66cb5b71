pub mod packet;
pub mod queue;
pub mod sniffer;

pub use packet::{protocol_name, PacketView};
pub use queue::PacketQueue;
pub use sniffer::{CaptureError, PacketSniffer};
