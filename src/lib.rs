//! # Nexmosphere protocol engine
//!
//! Runtime core for a network of Nexmosphere sensor/actuator controllers
//! attached over serial links. The engine decodes the vendor's compact
//! text protocol into typed events — button presses, RFID tag movement,
//! presence detection, device discovery — and fans them out to any number
//! of registered handlers without ever stalling the decode loop.
//!
//! ## Architecture
//!
//! - [`protocol`] - feedback line decoding and outbound wire framing
//! - [`device`] - per-address device model, button debounce/hold machine
//! - [`controller`] - per-link ingestion loop and paced command queue
//! - [`events`] - typed events and the fan-out dispatcher
//! - [`transport`] - seam to the external serial transport layer
//! - [`service`] - discovery loop, controller registry, control surface
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nexbus::{Event, Service};
//! # fn provider() -> Box<dyn nexbus::TransportProvider> { unimplemented!() }
//!
//! # async fn run() -> Result<(), nexbus::ServiceError> {
//! let service = Service::new(provider());
//! service.add_handler(Arc::new(|event: Event| {
//!     println!("{} {:?}/{:?}", event.controller, event.kind, event.action);
//! }));
//! service.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! Transport discovery (USB enumeration, opening ports at 115200 8N1) is
//! deliberately outside this crate: implement [`TransportProvider`] over
//! whatever byte streams you have.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod controller;
pub mod device;
pub mod events;
pub mod protocol;
pub mod service;
pub mod transport;

// Re-export the main public types for convenience
pub use controller::{Controller, ControllerError, ControllerInfo, QueueTier};
pub use device::{Device, DeviceKind};
pub use events::{Action, Dispatcher, Event, EventHandler, EventKind, HandlerId};
pub use protocol::{decode_feedback, Feedback, FeedbackKind};
pub use service::{Service, ServiceConfig, ServiceError};
pub use transport::{PortDescriptor, SerialLink, TransportProvider};
