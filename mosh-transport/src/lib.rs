//! Fragmentation, the datagram connection, and the sender/receiver halves
//! of the state-synchronization transport.

pub mod connection;
pub mod error;
pub mod fragment;
pub mod protocol;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod sync_state;
pub mod time;

pub use connection::Connection;
pub use error::{Error, Result};
pub use fragment::{Assembler, Fragmenter};
pub use protocol::{Fragment, Instruction, PROTOCOL_VERSION, SHUTDOWN};
pub use receiver::TransportReceiver;
pub use rtt::RttEstimator;
pub use sender::{ShutdownState, TransportSender};
pub use sync_state::{SyncState, TimestampedState};
