//! # nearhelp-core
//!
//! Domain layer of the Nearhelp coordination engine: the help-request
//! lifecycle state machine, the geospatial nearby index, typed domain
//! events, and the realtime wire protocol.  This crate is runtime-agnostic;
//! the server crate wires it to tokio, axum and the store.

pub mod constants;
pub mod events;
pub mod geo;
pub mod protocol;
pub mod request;
pub mod types;

mod error;

pub use error::LifecycleError;
pub use request::{ChatMessage, HelpRequest, LiveLocation, LocationFix};
pub use types::{now_utc, Coordinate, ParticipantId, RequestId, RequestStatus, Role, Visibility};
