//! Chrome DevTools Protocol client: a background transport task owning the
//! WebSocket, plus a clonable handle for commands and event subscriptions.

mod client;
mod error;
mod transport;
mod types;

pub use client::{CdpClient, CdpConfig};
pub use error::CdpError;
pub use transport::{KeepaliveConfig, ReconnectConfig};
pub use types::{CdpCommand, CdpEvent, CdpProtocolError, CdpResponse, MessageKind, RawCdpMessage};
