//! A UPnP AV protocol stack (spec.md §1): the client and device halves of
//! the four standard services used for home-media networking —
//! `ConnectionManager`, `ContentDirectory`, `AVTransport`,
//! `RenderingControl` — plus the generic machinery they all sit on: an
//! HTTP/1.1 client and server, a SOAP action pipeline, GENA eventing with
//! auto-renewing subscriptions, and a `LastChange` aggregator.
//!
//! SSDP discovery, a general XML-binding layer, high-level renderer
//! convenience classes, and CLI/config/logging setup are deliberately out
//! of scope — this crate consumes a parsed [`device::Device`] descriptor
//! and exposes the service clients/devices that act on it.

pub mod device;
pub mod didl;
pub mod error;
pub mod gena;
pub mod http;
pub mod last_change;
pub mod root_device;
pub mod service_client;
pub mod service_device;
pub mod services;
pub mod soap;
pub mod subscription;
pub mod xml;

pub use device::{parse_device_description, Device, Service};
pub use error::{Error, Result};
pub use root_device::{DeviceService, RootDevice, ServiceMount};
