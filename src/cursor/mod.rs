//! Cursor SQLite snapshot monitor.
//!
//! Cursor persists workspace state in per-workspace `state.vscdb` files and
//! a global store. The monitor polls them read-only and emits events for new
//! generations, composer changes, conversation bubbles, background-composer
//! updates, and file history additions.

pub mod extract;
pub mod monitor;
pub mod platform;

pub use monitor::CursorMonitor;
