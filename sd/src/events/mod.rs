//! Progress broadcast
//!
//! Workers and the state manager publish [`TaskEvent`]s to the [`ProgressBus`];
//! subscribers attach per task and receive a [`PushMessage::InitialState`]
//! followed by [`PushMessage::Update`]s.
//!
//! ```text
//!   StateManager ──(status changes)──┐
//!                                    ├──> ProgressBus ──> task A subscribers
//!   Worker relay ──(progress, logs)──┘        │
//!                                             └─────────> task B subscribers
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, ProgressBus};
pub use types::{PushMessage, TaskEvent};
