//! The four concrete UPnP AV services (spec.md §4.7). Each submodule owns
//! its own `Traits` marker type, a `Client`, and a device-side `Device`
//! with a synchronous `dispatch` entry point that [`crate::root_device`]
//! routes SOAP actions to.

pub mod av_transport;
pub mod connection_manager;
pub mod content_directory;
pub mod rendering_control;
