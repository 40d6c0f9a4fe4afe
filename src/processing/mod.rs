//! Deterministic command and event processing.
//!
//! Commands come from session command entries and from follow-up records inside
//! application entries. Handlers turn a command into events (applied to state right away)
//! and further commands; the [`StreamProcessor`] writes them as one application entry
//! and answers the client once that entry is durable.

pub mod appliers;
pub mod control;
pub mod handlers;
pub mod processor;
pub mod registry;
pub mod response;

pub use appliers::EventAppliers;
pub use control::{CommandControl, ControlResult, ProcessingControl};
pub use handlers::AwaitResultControl;
pub use processor::{Phase, StreamProcessor};
pub use registry::{CommandProcessor, HandlerRegistry, HandlerRegistryBuilder};
pub use response::{
    CommandResponse, Outcome, Rejection, ResponseReceiver, ResponseSender, response_channel,
};
