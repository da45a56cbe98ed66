pub mod manager;
pub mod ports;

pub use manager::{ContainerManager, RuntimeConfig};
pub use ports::{PortAllocator, ScanningAllocator};
