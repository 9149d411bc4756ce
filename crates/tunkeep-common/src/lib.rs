//! Common infrastructure for the tunkeep IPv6 tunnel keeper.
//!
//! - [`shell`]: shell command execution with proper quoting
//! - [`error`]: the error taxonomy shared by all keeper components
//!
//! # Example
//!
//! ```ignore
//! use tunkeep_common::{
//!     shell::{self, IP_CMD, shellquote},
//!     KeeperResult,
//! };
//!
//! async fn link_up(ifname: &str) -> KeeperResult<()> {
//!     let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(ifname));
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{KeeperError, KeeperResult};
