//! Weft flow — cold flows, operator fusion, and hot multicast flows on top
//! of the weft-core runtime.
//!
//! Provides the `Flow` type with its builders and operators, the
//! channel-bearing operator fusion (`flow_on`/`buffer`/`conflate`), terminal
//! reducers, time-based operators, and `SharedFlow`/`StateFlow`.
#![warn(clippy::all)]

pub mod channel_flow;
pub mod errors;
pub mod flow;
pub mod reduce;
pub mod shared;
pub mod state;
pub mod time_ops;
pub mod transform;

pub use channel_flow::{channel_flow, ReceiveAsFlow};
pub use flow::{empty_flow, flow, flow_of, CollectorRef, Flow, FlowCollector, FlowSink};
pub use shared::MutableSharedFlow;
pub use state::MutableStateFlow;

// The runtime types that appear in flow signatures.
pub use weft_core::channel::Overflow;
pub use weft_core::error::Failure;
