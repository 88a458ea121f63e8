//! Connection multiplexing and session relay.
//!
//! Two runtimes share the same session model:
//! - `mio`: one thread, one readiness loop, hub owned by the loop
//! - `tokio`: one task per connection, hub owned by an actor task
//!
//! Both share common abstractions:
//! - `ConnectionTable`: fixed-capacity slot arena with lowest-free allocation
//! - `SessionRegistry`: slot to session metadata
//! - `Hub`: keeps the table and registry consistent
//! - `LineBuffer`/`Command`: newline framing and `-q`/`-s` classification

pub mod command;
pub mod hub;
pub mod listener;
pub mod mio;
pub mod session;
pub mod table;
pub mod tokio;

pub use command::{Command, LineBuffer};
pub use hub::{CloseReason, Hub, Rejected};
pub use session::{Session, SessionRegistry, SessionState};
pub use table::{ConnectionTable, SlotId};
