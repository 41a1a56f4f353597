//! Transfer Engine — request/response negotiation, the metadata handshake,
//! windowed chunk streaming, completion signaling, and error handling.

pub mod engine;
pub mod session;

pub use engine::{EngineSignal, TransferEngine};
pub use session::{Direction, TransferSession, TransferStatus};
