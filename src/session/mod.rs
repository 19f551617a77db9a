pub mod channel;
pub mod loopback;
pub mod signals;
pub mod supervisor;

pub use channel::UnixTransport;
pub use loopback::{LoopbackTransport, SimPeer};
pub use supervisor::{Session, SpawnOptions};
