//! # SyncKit Cross-Tab Coordination
//!
//! Leader election, heartbeat-driven divergence detection, and
//! full-state recovery between the tabs of one browsing context sharing
//! a document.
//!
//! Each document gets a named broadcast bus (`synckit-<documentId>`).
//! Tabs announce themselves, run an oldest-first election, and the
//! winner heartbeats on an interval. When a state provider is wired, the
//! leader's heartbeats carry a deterministic digest of its state;
//! followers compare digests and repair divergence by requesting the
//! leader's exact snapshot.
//!
//! ## Quick start
//!
//! ```rust
//! use synckit_tabs::{CoordinatorConfig, TabBus, TabCoordinator};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = TabBus::new("doc-1");
//!
//! let tab = TabCoordinator::new("doc-1", bus.clone(), CoordinatorConfig::default());
//! tab.start();
//!
//! // a lone tab elevates itself after the settle window
//! tokio::time::sleep(std::time::Duration::from_millis(200)).await;
//! assert!(tab.is_leader());
//! # }
//! ```
//!
//! ## Guarantees and limits
//!
//! - At most one leader in steady state; elections converge within the
//!   settle window after a disturbance, and a lost leader is replaced
//!   within the heartbeat timeout
//! - Sequence numbers order messages per sender only; divergence
//!   detection is optimistic and eventually consistent
//! - Without a shared broadcast primitive the coordinator degrades to a
//!   leader-of-one; cross-process correctness stays with the sync layer

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod messages;

pub use bus::TabBus;
pub use config::CoordinatorConfig;
pub use coordinator::{RelayHandle, TabCoordinator, TabRole, TabState};
pub use error::{Result, TabError};
pub use messages::{RelayKind, TabId, TabMessage, TabMessageKind, TabSnapshot};
