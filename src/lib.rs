//! Software-emulation shim for an accelerator card.
//!
//! Presents the device API surface (buffer objects, control registers,
//! streaming queues, binary load) while the actual compute runs in a
//! separately launched simulator process. This crate is the bookkeeping
//! and coordination layer: bank allocators, the buffer-object registry,
//! the chunked transfer engine, the subprocess supervisor, and the
//! call/response protocol that carries every operation to the peer.

pub mod config;
pub mod container;
pub mod device;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod utils;

pub use config::Config;
pub use device::{Completion, Device, DeviceInfo, ExportToken, LoadState};
pub use error::{ShimError, ShimResult};
pub use memory::MemoryBank;
