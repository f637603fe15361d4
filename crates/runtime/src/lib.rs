//! RoomBridge turn execution runtime.
//!
//! Admission ([`dispatcher`]), per-room mutual exclusion ([`turn_lock`]),
//! queueing ([`queue`], [`debounce`], [`steer`]) and the streaming
//! completion engine ([`engine`]).  Chat networks, storage, prompts and
//! tools plug in through the traits in [`ports`].

pub mod cancel;
pub mod cli;
pub mod debounce;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod memory;
pub mod ports;
pub mod queue;
pub mod steer;
pub mod testing;
pub mod turn;
pub mod turn_lock;

pub use dispatcher::{Admission, Collaborators, TurnDispatcher};
pub use engine::{CompletionEngine, TurnRequest};
pub use error::{AdmissionError, TurnError};
pub use turn::{DeltaSequence, StreamingTurn, TurnOutcome, TurnStatus};
