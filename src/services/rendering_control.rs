//! `RenderingControl:1` (spec.md §4.7). Every state variable here is
//! channel-keyed (spec.md §3: "attributes attached to a single variable
//! occurrence"), so the variable store holds one entry per
//! `(variable, channel)` pair rather than per bare variable name, and
//! `LastChange` events carry a `channel="..."` attribute on each changed
//! element.
//!
//! Grounded in `upnp.renderingcontrol.types.h`'s `Channel` enumeration and
//! `upnprenderingcontrolservice.cpp`'s preset handling.

use crate::error::{Error, Result};
use crate::last_change::LastChange;
use crate::service_client::{ServiceClient, ServiceTraits};
use crate::service_device::{DeviceServiceTraits, ServiceDevice};
use crate::soap::UpnpError;
use std::fmt;
use std::sync::OnceLock;

pub const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
pub const SERVICE_ID: &str = "urn:upnp-org:serviceId:RenderingControl";
pub const EVENT_NAMESPACE: &str = "urn:schemas-upnp-org:metadata-1-0/RCS/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Master,
    Lf,
    Rf,
    Cf,
    Lfe,
    Ls,
    Rs,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Master => "Master",
            Channel::Lf => "LF",
            Channel::Rf => "RF",
            Channel::Cf => "CF",
            Channel::Lfe => "LFE",
            Channel::Ls => "LS",
            Channel::Rs => "RS",
        })
    }
}

impl std::str::FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Master" => Channel::Master,
            "LF" => Channel::Lf,
            "RF" => Channel::Rf,
            "CF" => Channel::Cf,
            "LFE" => Channel::Lfe,
            "LS" => Channel::Ls,
            "RS" => Channel::Rs,
            other => return Err(Error::InvalidArguments(format!("unknown channel {other:?}"))),
        })
    }
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
    pub async fn get_volume(&self, instance_id: u32, channel: Channel) -> Result<u16> {
        let out = self
            .invoke(
                "GetVolume",
                &[("InstanceID".into(), instance_id.to_string()), ("Channel".into(), channel.to_string())],
            )
            .await?;
        field(&out, "CurrentVolume")
            .parse()
            .map_err(|_| Error::InvalidArguments("malformed CurrentVolume".into()))
    }

    pub async fn set_volume(&self, instance_id: u32, channel: Channel, value: u16) -> Result<()> {
        self.invoke(
            "SetVolume",
            &[
                ("InstanceID".into(), instance_id.to_string()),
                ("Channel".into(), channel.to_string()),
                ("DesiredVolume".into(), value.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_mute(&self, instance_id: u32, channel: Channel) -> Result<bool> {
        let out = self
            .invoke(
                "GetMute",
                &[("InstanceID".into(), instance_id.to_string()), ("Channel".into(), channel.to_string())],
            )
            .await?;
        Ok(field(&out, "CurrentMute") == "1")
    }

    pub async fn set_mute(&self, instance_id: u32, channel: Channel, muted: bool) -> Result<()> {
        self.invoke(
            "SetMute",
            &[
                ("InstanceID".into(), instance_id.to_string()),
                ("Channel".into(), channel.to_string()),
                ("DesiredMute".into(), if muted { "1".into() } else { "0".into() }),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn list_presets(&self, instance_id: u32) -> Result<Vec<String>> {
        let out = self.invoke("ListPresets", &[("InstanceID".into(), instance_id.to_string())]).await?;
        let raw = field(&out, "CurrentPresetNameList");
        Ok(raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    }

    pub async fn select_preset(&self, instance_id: u32, preset_name: &str) -> Result<()> {
        self.invoke(
            "SelectPreset",
            &[("InstanceID".into(), instance_id.to_string()), ("PresetName".into(), preset_name.to_string())],
        )
        .await?;
        Ok(())
    }
}

fn field(args: &[(String, String)], name: &str) -> String {
    args.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()).unwrap_or_default()
}

fn var_key(name: &str, channel: Channel) -> String {
    format!("{name}@{channel}")
}

/// Device-side `RenderingControl`: one variable slot per `(name, channel)`
/// pair, batched through `LastChange` with a `channel="..."` attribute on
/// each changed element (spec.md §4.7).
pub struct Device {
    base: ServiceDevice<Traits>,
    last_change: OnceLock<LastChange>,
}

impl Device {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { base: ServiceDevice::new(), last_change: OnceLock::new() })
    }

    pub fn install_last_change(self: &std::sync::Arc<Self>, min_interval: std::time::Duration) {
        let device = self.clone();
        let lc = LastChange::new(min_interval, move |vars| {
            let device = device.clone();
            async move {
                let xml = build_channel_last_change_xml(&vars);
                device.base.notify_change(vec![("LastChange".to_string(), xml)]).await
            }
        });
        let _ = self.last_change.set(lc);
    }

    pub fn base(&self) -> &ServiceDevice<Traits> {
        &self.base
    }

    /// Initializes `instance_id`'s channel variables to their power-on
    /// defaults (spec.md §3: each rendering instance keeps its own copy).
    pub fn init(&self, instance_id: u32) {
        for channel in [Channel::Master] {
            self.set_and_record(instance_id, "Volume", channel, "50");
            self.set_and_record(instance_id, "Mute", channel, "0");
        }
        self.base.set_variable(instance_id, "PresetNameList", "FactoryDefaults");
    }

    fn set_and_record(&self, instance_id: u32, name: &str, channel: Channel, value: impl Into<String>) {
        let value = value.into();
        self.base.set_variable(instance_id, var_key(name, channel), value.clone());
        if let Some(lc) = self.last_change.get() {
            // Packs `name`, `channel`, and `value` so the emit closure can
            // rebuild the `channel="..."` attribute without a second lookup.
            lc.record(instance_id, var_key(name, channel), format!("{channel}\u{0}{value}"));
        }
    }

    fn get_var(&self, instance_id: u32, name: &str, channel: Channel) -> Option<String> {
        self.base.get_variable(instance_id, &var_key(name, channel))
    }

    pub fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, UpnpError> {
        let instance_id = || -> std::result::Result<u32, UpnpError> {
            field(args, "InstanceID")
                .parse()
                .map_err(|_| UpnpError::new(402, "missing or invalid InstanceID"))
        };
        let channel = || -> std::result::Result<Channel, UpnpError> {
            field(args, "Channel")
                .parse::<Channel>()
                .map_err(|_| UpnpError::new(402, "invalid Channel"))
        };

        match action {
            "GetVolume" => {
                let instance_id = instance_id()?;
                let ch = channel()?;
                Ok(vec![("CurrentVolume".into(), self.get_var(instance_id, "Volume", ch).unwrap_or_else(|| "0".into()))])
            }
            "SetVolume" => {
                let instance_id = instance_id()?;
                let ch = channel()?;
                let value: u16 = field(args, "DesiredVolume").parse().map_err(|_| UpnpError::new(402, "invalid DesiredVolume"))?;
                if value > 100 {
                    return Err(UpnpError::new(402, "volume out of range"));
                }
                self.set_and_record(instance_id, "Volume", ch, value.to_string());
                Ok(vec![])
            }
            "GetMute" => {
                let instance_id = instance_id()?;
                let ch = channel()?;
                Ok(vec![("CurrentMute".into(), self.get_var(instance_id, "Mute", ch).unwrap_or_else(|| "0".into()))])
            }
            "SetMute" => {
                let instance_id = instance_id()?;
                let ch = channel()?;
                let desired = field(args, "DesiredMute");
                let muted = desired == "1" || desired.eq_ignore_ascii_case("true");
                self.set_and_record(instance_id, "Mute", ch, if muted { "1" } else { "0" });
                Ok(vec![])
            }
            "ListPresets" => {
                let instance_id = instance_id()?;
                Ok(vec![("CurrentPresetNameList".into(), self.base.get_variable(instance_id, "PresetNameList").unwrap_or_default())])
            }
            "SelectPreset" => {
                let instance_id = instance_id()?;
                let preset = field(args, "PresetName");
                let known = self.base.get_variable(instance_id, "PresetNameList").unwrap_or_default();
                if !known.split(',').any(|p| p == preset) {
                    return Err(UpnpError::new(701, "preset not found"));
                }
                Ok(vec![])
            }
            _ => Err(UpnpError::code_only(401)),
        }
    }
}

/// Builds the `LastChange` body for `RenderingControl`: unlike AVTransport
/// (plain `val="..."`), each changed element also carries `channel="..."`
/// since every variable here is instance+channel scoped.
fn build_channel_last_change_xml(vars: &[(u32, String, String)]) -> String {
    let mut instances: Vec<u32> = vars.iter().map(|(instance_id, _, _)| *instance_id).collect();
    instances.sort_unstable();
    instances.dedup();

    let mut body = String::new();
    for instance_id in instances {
        let mut instance_body = String::new();
        for (iid, key, packed) in vars {
            if *iid != instance_id {
                continue;
            }
            let name = key.split('@').next().unwrap_or(key);
            let (channel, value) = packed.split_once('\u{0}').unwrap_or(("Master", packed.as_str()));
            instance_body.push_str(&format!(
                "<{name} val=\"{}\" channel=\"{}\"/>",
                crate::xml::xml_escape(value),
                crate::xml::xml_escape(channel)
            ));
        }
        body.push_str(&format!("<InstanceID val=\"{instance_id}\">{instance_body}</InstanceID>"));
    }
    format!("<Event xmlns=\"{EVENT_NAMESPACE}\">{body}</Event>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips() {
        assert_eq!("Master".parse::<Channel>().unwrap(), Channel::Master);
        assert_eq!(Channel::Lf.to_string(), "LF");
        assert!("Bogus".parse::<Channel>().is_err());
    }

    #[test]
    fn dispatch_set_and_get_volume() {
        let device = Device::new();
        device.init(0);
        let args = vec![
            ("InstanceID".to_string(), "0".to_string()),
            ("Channel".to_string(), "Master".to_string()),
            ("DesiredVolume".to_string(), "49".to_string()),
        ];
        device.dispatch("SetVolume", &args).unwrap();
        let out = device
            .dispatch("GetVolume", &[("InstanceID".to_string(), "0".to_string()), ("Channel".to_string(), "Master".to_string())])
            .unwrap();
        assert_eq!(out, vec![("CurrentVolume".to_string(), "49".to_string())]);
    }

    #[test]
    fn dispatch_rejects_volume_out_of_range() {
        let device = Device::new();
        device.init(0);
        let args = vec![
            ("InstanceID".to_string(), "0".to_string()),
            ("Channel".to_string(), "Master".to_string()),
            ("DesiredVolume".to_string(), "101".to_string()),
        ];
        let err = device.dispatch("SetVolume", &args).unwrap_err();
        assert_eq!(err.code, 402);
    }

    #[test]
    fn dispatch_rejects_unknown_preset() {
        let device = Device::new();
        device.init(0);
        let args = vec![("InstanceID".to_string(), "0".to_string()), ("PresetName".to_string(), "Movie".to_string())];
        let err = device.dispatch("SelectPreset", &args).unwrap_err();
        assert_eq!(err.code, 701);
    }

    #[test]
    fn last_change_xml_carries_channel_attribute() {
        let xml = build_channel_last_change_xml(&[(0, "Volume@Master".to_string(), "Master\u{0}49".to_string())]);
        assert!(xml.contains("<Volume val=\"49\" channel=\"Master\"/>"));
    }

    #[test]
    fn dispatch_isolates_volume_per_instance() {
        let device = Device::new();
        device.init(0);
        device.init(1);
        device
            .dispatch(
                "SetVolume",
                &[
                    ("InstanceID".to_string(), "1".to_string()),
                    ("Channel".to_string(), "Master".to_string()),
                    ("DesiredVolume".to_string(), "80".to_string()),
                ],
            )
            .unwrap();

        let instance0 = device
            .dispatch("GetVolume", &[("InstanceID".to_string(), "0".to_string()), ("Channel".to_string(), "Master".to_string())])
            .unwrap();
        let instance1 = device
            .dispatch("GetVolume", &[("InstanceID".to_string(), "1".to_string()), ("Channel".to_string(), "Master".to_string())])
            .unwrap();
        assert_eq!(instance0, vec![("CurrentVolume".to_string(), "50".to_string())]);
        assert_eq!(instance1, vec![("CurrentVolume".to_string(), "80".to_string())]);
    }
}
