//! Per-invocation lifecycle state machine.
//!
//! `CREATED → FACILITATED → {RUNNING_SYNC | AWAITING_RESPONSE | AWAITING_CHILDREN} → COMPLETED`
//!
//! The awaiting states are the only ones in which an invocation is suspended.
//! `COMPLETED` is terminal; retrying a step is a new invocation with the next
//! retry index on its ambiance level.

pub mod errors;
pub mod events;
pub mod invocation_state_machine;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::InvocationEvent;
pub use invocation_state_machine::{InvocationStateMachine, StateTransition};
pub use states::InvocationState;
