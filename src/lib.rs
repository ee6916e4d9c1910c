//! Driver for Nation-protocol UHF RFID readers.
//!
//! Talks the binary framed protocol (0x5A header, CRC-16 trailer) over a
//! byte transport, and layers on top of it a command engine, a threaded
//! continuous-inventory mode with callbacks, and EPC write flows with
//! match guards and verification.
//!
//! # Features
//!
//! - `serial` - Serial port transport for desktop using serialport crate
//!
//! # Example
//!
//! ```ignore
//! use nation_uhf::{NationReader, SerialTransport};
//!
//! let transport = SerialTransport::new("/dev/ttyUSB0", 115200)?;
//! let reader = NationReader::new(transport);
//!
//! reader.start_inventory(&[1, 2], |tag| {
//!     println!("tag {} on antenna {}", tag.epc, tag.antenna_id);
//! })?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! reader.stop_inventory()?;
//! ```

mod epc;
mod frame;
mod inventory;
mod reader;
mod transport;
mod types;

#[cfg(feature = "serial")]
mod serial;

// Re-exports
pub use epc::{calculate_start_word, TargetWriteOptions, WriteRequest};
pub use frame::Mid;
pub use inventory::InventoryState;
pub use reader::NationReader;
pub use transport::RfidTransport;
pub use types::{
    validate_epc_hex, BasebandConfig, BuzzerMode, DeviceInfo, EndReason, FilterSettings,
    FrameError, ReaderConfig, ReaderError, ReaderProfile, RfBand, RfidAbility, TagRecord,
    WorkingFrequency, WriteOutcome, WriteStatus,
};

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
