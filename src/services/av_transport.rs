//! `AVTransport:1` (spec.md §4.7). The transport-state machine service:
//! playback control plus the media/position/transport info triad. Variable
//! changes batch through [`crate::last_change::LastChange`] except the four
//! positional variables, which spec.md excludes from aggregation because
//! they'd otherwise dominate every emitted batch.
//!
//! Grounded in `upnp.avtransport.types.h`'s `Action`/`Variable`/`SeekMode`
//! enumerations and `upnpavtransportservice.cpp`'s fault catalog.

use crate::error::Result;
use crate::last_change::{build_last_change_xml, LastChange};
use crate::service_client::{ServiceClient, ServiceTraits};
use crate::service_device::{DeviceServiceTraits, ServiceDevice};
use crate::soap::UpnpError;
use std::fmt;
use std::sync::OnceLock;

pub const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:AVTransport:1";
pub const SERVICE_ID: &str = "urn:upnp-org:serviceId:AVTransport";
pub const EVENT_NAMESPACE: &str = "urn:schemas-upnp-org:metadata-1-0/AVT/";

/// The four position-tracking variables spec.md §4.7 excludes from
/// `LastChange` aggregation (they change every second during playback).
pub const POSITION_VARIABLES: &[&str] = &[
    "RelativeTimePosition",
    "AbsoluteTimePosition",
    "RelativeCounterPosition",
    "AbsoluteCounterPosition",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    TrackNr,
    AbsTime,
    RelTime,
    AbsCount,
    RelCount,
}

impl fmt::Display for SeekMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SeekMode::TrackNr => "TRACK_NR",
            SeekMode::AbsTime => "ABS_TIME",
            SeekMode::RelTime => "REL_TIME",
            SeekMode::AbsCount => "ABS_COUNT",
            SeekMode::RelCount => "REL_COUNT",
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub current_transport_state: String,
    pub current_transport_status: String,
    pub current_speed: String,
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub track: u32,
    pub track_duration: String,
    pub track_metadata: String,
    pub track_uri: String,
    pub rel_time: String,
    pub abs_time: String,
    pub rel_count: i32,
    pub abs_count: i32,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub nr_tracks: u32,
    pub media_duration: String,
    pub current_uri: String,
    pub current_uri_metadata: String,
    pub next_uri: String,
    pub next_uri_metadata: String,
    pub playback_storage_medium: String,
}

pub struct Traits;
impl ServiceTraits for Traits {
    const SERVICE_TYPE: &'static str = SERVICE_TYPE;
}
impl DeviceServiceTraits for Traits {
    const SERVICE_TYPE: &'static str = SERVICE_TYPE;
    const SERVICE_ID: &'static str = SERVICE_ID;
}

pub type Client = ServiceClient<Traits>;

impl Client {
    pub async fn set_av_transport_uri(&self, instance_id: u32, uri: &str, metadata: &str) -> Result<()> {
        self.invoke(
            "SetAVTransportURI",
            &[
                ("InstanceID".into(), instance_id.to_string()),
                ("CurrentURI".into(), uri.to_string()),
                ("CurrentURIMetaData".into(), metadata.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn play(&self, instance_id: u32, speed: &str) -> Result<()> {
        self.invoke(
            "Play",
            &[("InstanceID".into(), instance_id.to_string()), ("Speed".into(), speed.to_string())],
        )
        .await?;
        Ok(())
    }

    pub async fn pause(&self, instance_id: u32) -> Result<()> {
        self.invoke("Pause", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(())
    }

    pub async fn stop(&self, instance_id: u32) -> Result<()> {
        self.invoke("Stop", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(())
    }

    pub async fn seek(&self, instance_id: u32, mode: SeekMode, target: &str) -> Result<()> {
        self.invoke(
            "Seek",
            &[
                ("InstanceID".into(), instance_id.to_string()),
                ("Unit".into(), mode.to_string()),
                ("Target".into(), target.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn next(&self, instance_id: u32) -> Result<()> {
        self.invoke("Next", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(())
    }

    pub async fn previous(&self, instance_id: u32) -> Result<()> {
        self.invoke("Previous", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(())
    }

    pub async fn get_transport_info(&self, instance_id: u32) -> Result<TransportInfo> {
        let out = self.invoke("GetTransportInfo", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(TransportInfo {
            current_transport_state: field(&out, "CurrentTransportState"),
            current_transport_status: field(&out, "CurrentTransportStatus"),
            current_speed: field(&out, "CurrentSpeed"),
        })
    }

    pub async fn get_position_info(&self, instance_id: u32) -> Result<PositionInfo> {
        let out = self.invoke("GetPositionInfo", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(PositionInfo {
            track: field(&out, "Track").parse().unwrap_or(0),
            track_duration: field(&out, "TrackDuration"),
            track_metadata: field(&out, "TrackMetaData"),
            track_uri: field(&out, "TrackURI"),
            rel_time: field(&out, "RelTime"),
            abs_time: field(&out, "AbsTime"),
            rel_count: field(&out, "RelCount").parse().unwrap_or(0),
            abs_count: field(&out, "AbsCount").parse().unwrap_or(0),
        })
    }

    pub async fn get_media_info(&self, instance_id: u32) -> Result<MediaInfo> {
        let out = self.invoke("GetMediaInfo", &[("InstanceID".into(), instance_id.to_string())]).await?;
        Ok(MediaInfo {
            nr_tracks: field(&out, "NrTracks").parse().unwrap_or(0),
            media_duration: field(&out, "MediaDuration"),
            current_uri: field(&out, "CurrentURI"),
            current_uri_metadata: field(&out, "CurrentURIMetaData"),
            next_uri: field(&out, "NextURI"),
            next_uri_metadata: field(&out, "NextURIMetaData"),
            playback_storage_medium: field(&out, "PlaybackStorageMedium"),
        })
    }

    pub async fn get_current_transport_actions(&self, instance_id: u32) -> Result<Vec<String>> {
        let out = self
            .invoke("GetCurrentTransportActions", &[("InstanceID".into(), instance_id.to_string())])
            .await?;
        let raw = field(&out, "Actions");
        Ok(raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    }
}

fn field(args: &[(String, String)], name: &str) -> String {
    args.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()).unwrap_or_default()
}

/// Device-side `AVTransport`: the per-instance variable store plus the
/// `LastChange` aggregator that batches every variable except
/// [`POSITION_VARIABLES`].
pub struct Device {
    base: ServiceDevice<Traits>,
    last_change: OnceLock<LastChange>,
}

impl Device {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { base: ServiceDevice::new(), last_change: OnceLock::new() })
    }

    /// Wires the `LastChange` aggregator to notify this device's
    /// subscribers. Split from `new` because the aggregator's emit closure
    /// needs a handle back to the (by-then Arc'd) device.
    pub fn install_last_change(self: &std::sync::Arc<Self>, min_interval: std::time::Duration) {
        let device = self.clone();
        let lc = LastChange::new(min_interval, move |vars| {
            let device = device.clone();
            async move {
                let xml = build_last_change_xml(EVENT_NAMESPACE, &vars);
                device.base.notify_change(vec![("LastChange".to_string(), xml)]).await
            }
        });
        let _ = self.last_change.set(lc);
    }

    pub fn base(&self) -> &ServiceDevice<Traits> {
        &self.base
    }

    /// Initializes `instance_id`'s variable set to its power-on defaults
    /// (spec.md §3: each transport instance keeps its own copy).
    pub fn init(&self, instance_id: u32) {
        self.base.set_variable(instance_id, "TransportState", "STOPPED");
        self.base.set_variable(instance_id, "TransportStatus", "OK");
        self.base.set_variable(instance_id, "CurrentPlayMode", "NORMAL");
        self.base.set_variable(instance_id, "TransportPlaySpeed", "1");
        self.base.set_variable(instance_id, "NumberOfTracks", "0");
        self.base.set_variable(instance_id, "CurrentTrack", "0");
        self.base.set_variable(instance_id, "CurrentTrackDuration", "0:00:00");
        self.base.set_variable(instance_id, "CurrentMediaDuration", "0:00:00");
        self.base.set_variable(instance_id, "CurrentTrackURI", "");
        self.base.set_variable(instance_id, "CurrentTrackMetaData", "");
        self.base.set_variable(instance_id, "AVTransportURI", "");
        self.base.set_variable(instance_id, "AVTransportURIMetaData", "");
        self.base.set_variable(instance_id, "NextAVTransportURI", "");
        self.base.set_variable(instance_id, "NextAVTransportURIMetaData", "");
        self.base.set_variable(instance_id, "RelativeTimePosition", "0:00:00");
        self.base.set_variable(instance_id, "AbsoluteTimePosition", "0:00:00");
        self.base.set_variable(instance_id, "RelativeCounterPosition", "0");
        self.base.set_variable(instance_id, "AbsoluteCounterPosition", "0");
        self.base.set_variable(instance_id, "CurrentTransportActions", "Play");
    }

    /// Records a variable mutation for `instance_id` and routes it to the
    /// right notification path: the four positional variables bypass
    /// `LastChange` entirely (spec.md §4.7), everything else is coalesced
    /// through it.
    fn set_and_record(&self, instance_id: u32, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.base.set_variable(instance_id, name, value.clone());
        if POSITION_VARIABLES.contains(&name) {
            return;
        }
        if let Some(lc) = self.last_change.get() {
            lc.record(instance_id, name, value);
        }
    }

    pub fn set_transport_state(&self, instance_id: u32, state: &str) {
        self.set_and_record(instance_id, "TransportState", state);
    }

    pub fn set_av_transport_uri(&self, instance_id: u32, uri: &str, metadata: &str) {
        self.set_and_record(instance_id, "AVTransportURI", uri);
        self.set_and_record(instance_id, "AVTransportURIMetaData", metadata);
    }

    /// Executes one action synchronously (spec.md §5: device dispatch is
    /// CPU-bound, never network I/O). Unknown actions are rejected as
    /// `UnsupportedAction` (401); argument errors as `InvalidArgs` (402).
    pub fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, UpnpError> {
        let instance_id = || -> std::result::Result<u32, UpnpError> {
            field(args, "InstanceID")
                .parse()
                .map_err(|_| UpnpError::new(402, "missing or invalid InstanceID"))
        };

        match action {
            "SetAVTransportURI" => {
                let instance_id = instance_id()?;
                let uri = field(args, "CurrentURI");
                let meta = field(args, "CurrentURIMetaData");
                self.set_av_transport_uri(instance_id, &uri, &meta);
                self.set_transport_state(instance_id, "STOPPED");
                Ok(vec![])
            }
            "Play" => {
                let instance_id = instance_id()?;
                let speed = field(args, "Speed");
                self.set_and_record(instance_id, "TransportPlaySpeed", if speed.is_empty() { "1".to_string() } else { speed });
                self.set_transport_state(instance_id, "PLAYING");
                Ok(vec![])
            }
            "Pause" => {
                let instance_id = instance_id()?;
                self.set_transport_state(instance_id, "PAUSED_PLAYBACK");
                Ok(vec![])
            }
            "Stop" => {
                let instance_id = instance_id()?;
                self.set_transport_state(instance_id, "STOPPED");
                Ok(vec![])
            }
            "Seek" => {
                instance_id()?;
                let unit = field(args, "Unit");
                if !matches!(unit.as_str(), "TRACK_NR" | "ABS_TIME" | "REL_TIME" | "ABS_COUNT" | "REL_COUNT") {
                    return Err(UpnpError::new(710, "Seek mode not supported"));
                }
                Ok(vec![])
            }
            "Next" | "Previous" => {
                instance_id()?;
                Ok(vec![])
            }
            "GetTransportInfo" => {
                let instance_id = instance_id()?;
                Ok(vec![
                    ("CurrentTransportState".into(), self.base.get_variable(instance_id, "TransportState").unwrap_or_default()),
                    ("CurrentTransportStatus".into(), self.base.get_variable(instance_id, "TransportStatus").unwrap_or_default()),
                    ("CurrentSpeed".into(), self.base.get_variable(instance_id, "TransportPlaySpeed").unwrap_or_default()),
                ])
            }
            "GetPositionInfo" => {
                let instance_id = instance_id()?;
                Ok(vec![
                    ("Track".into(), self.base.get_variable(instance_id, "CurrentTrack").unwrap_or_default()),
                    ("TrackDuration".into(), self.base.get_variable(instance_id, "CurrentTrackDuration").unwrap_or_default()),
                    ("TrackMetaData".into(), self.base.get_variable(instance_id, "CurrentTrackMetaData").unwrap_or_default()),
                    ("TrackURI".into(), self.base.get_variable(instance_id, "CurrentTrackURI").unwrap_or_default()),
                    ("RelTime".into(), self.base.get_variable(instance_id, "RelativeTimePosition").unwrap_or_default()),
                    ("AbsTime".into(), self.base.get_variable(instance_id, "AbsoluteTimePosition").unwrap_or_default()),
                    ("RelCount".into(), self.base.get_variable(instance_id, "RelativeCounterPosition").unwrap_or_default()),
                    ("AbsCount".into(), self.base.get_variable(instance_id, "AbsoluteCounterPosition").unwrap_or_default()),
                ])
            }
            "GetMediaInfo" => {
                let instance_id = instance_id()?;
                Ok(vec![
                    ("NrTracks".into(), self.base.get_variable(instance_id, "NumberOfTracks").unwrap_or_default()),
                    ("MediaDuration".into(), self.base.get_variable(instance_id, "CurrentMediaDuration").unwrap_or_default()),
                    ("CurrentURI".into(), self.base.get_variable(instance_id, "AVTransportURI").unwrap_or_default()),
                    ("CurrentURIMetaData".into(), self.base.get_variable(instance_id, "AVTransportURIMetaData").unwrap_or_default()),
                    ("NextURI".into(), self.base.get_variable(instance_id, "NextAVTransportURI").unwrap_or_default()),
                    ("NextURIMetaData".into(), self.base.get_variable(instance_id, "NextAVTransportURIMetaData").unwrap_or_default()),
                    ("PlaybackStorageMedium".into(), "NETWORK".into()),
                ])
            }
            "GetCurrentTransportActions" => {
                let instance_id = instance_id()?;
                Ok(vec![("Actions".into(), self.base.get_variable(instance_id, "CurrentTransportActions").unwrap_or_default())])
            }
            _ => Err(UpnpError::code_only(401)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_mode_renders_wire_values() {
        assert_eq!(SeekMode::RelTime.to_string(), "REL_TIME");
        assert_eq!(SeekMode::TrackNr.to_string(), "TRACK_NR");
    }

    #[test]
    fn position_variables_are_excluded_from_last_change() {
        for v in ["RelativeTimePosition", "AbsoluteTimePosition", "RelativeCounterPosition", "AbsoluteCounterPosition"] {
            assert!(POSITION_VARIABLES.contains(&v));
        }
    }

    #[test]
    fn dispatch_play_updates_transport_state() {
        let device = Device::new();
        device.init(0);
        let args = vec![("InstanceID".to_string(), "0".to_string()), ("Speed".to_string(), "1".to_string())];
        device.dispatch("Play", &args).unwrap();
        assert_eq!(device.base().get_variable(0, "TransportState"), Some("PLAYING".to_string()));
    }

    #[test]
    fn dispatch_rejects_bad_seek_mode() {
        let device = Device::new();
        device.init(0);
        let args = vec![("InstanceID".to_string(), "0".to_string()), ("Unit".to_string(), "BOGUS".to_string()), ("Target".to_string(), "0".to_string())];
        let err = device.dispatch("Seek", &args).unwrap_err();
        assert_eq!(err.code, 710);
    }

    #[test]
    fn dispatch_unknown_action_is_401() {
        let device = Device::new();
        device.init(0);
        let err = device.dispatch("Bogus", &[]).unwrap_err();
        assert_eq!(err.code, 401);
    }

    #[test]
    fn get_transport_info_reflects_state() {
        let device = Device::new();
        device.init(0);
        device.dispatch("Play", &[("InstanceID".to_string(), "0".to_string()), ("Speed".to_string(), "1".to_string())]).unwrap();
        let out = device.dispatch("GetTransportInfo", &[("InstanceID".to_string(), "0".to_string())]).unwrap();
        assert!(out.contains(&("CurrentTransportState".to_string(), "PLAYING".to_string())));
    }

    #[test]
    fn dispatch_isolates_state_per_instance() {
        let device = Device::new();
        device.init(0);
        device.init(1);
        device.dispatch("Play", &[("InstanceID".to_string(), "1".to_string()), ("Speed".to_string(), "1".to_string())]).unwrap();

        let instance0 = device.dispatch("GetTransportInfo", &[("InstanceID".to_string(), "0".to_string())]).unwrap();
        let instance1 = device.dispatch("GetTransportInfo", &[("InstanceID".to_string(), "1".to_string())]).unwrap();
        assert!(instance0.contains(&("CurrentTransportState".to_string(), "STOPPED".to_string())));
        assert!(instance1.contains(&("CurrentTransportState".to_string(), "PLAYING".to_string())));
    }
}
