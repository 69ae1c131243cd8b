//! Chrome process management: binary resolution, launch, debug-endpoint
//! access, and termination.

mod endpoint;
mod error;
mod launcher;
mod platform;

pub use endpoint::{BrowserVersion, DebugEndpoint, TargetInfo};
pub use error::ChromeError;
pub use launcher::{ChromeHandle, ChromeLauncher, pick_ephemeral_port, terminate_process};
pub use platform::find_chrome_executable;
