//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the collaborators the queue and the submission engine depend
//! on without owning their implementation.
//!
//! ## Ports Overview
//!
//! - [`ITransport`] - Delivers one serialized batch and reports the HTTP-style status
//! - [`IClock`] - Time source for record and event timestamps
//! - [`IPayloadSerializer`] - Turns a batch payload into bytes

pub mod clock;
pub mod serializer;
pub mod transport;

pub use clock::{IClock, ManualClock, SystemClock};
pub use serializer::{IPayloadSerializer, JsonSerializer};
pub use transport::{ITransport, StreamKind, SubmitRequest, TransportResponse};
