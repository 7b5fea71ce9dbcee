//! `ConnectionManager:1` (spec.md §4.7). The simplest of the four services:
//! no eventing aggregation, a handful of actions, and one small value type
//! (`ProtocolInfo`) that's reused by `res@protocolInfo` in [`crate::didl`].

use crate::error::{Error, Result};
use crate::service_client::{ServiceClient, ServiceTraits};
use crate::service_device::{DeviceServiceTraits, ServiceDevice};
use std::fmt;
use std::str::FromStr;

pub const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";
pub const SERVICE_ID: &str = "urn:upnp-org:serviceId:ConnectionManager";

/// The `protocol:network:contentFormat:additionalInfo` 4-tuple used both in
/// `GetProtocolInfo` and in DIDL-Lite `res@protocolInfo` attributes. Each
/// field may be the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub protocol: String,
    pub network: String,
    pub content_format: String,
    pub additional_info: String,
}

impl ProtocolInfo {
    pub fn http_get(content_format: impl Into<String>) -> Self {
        Self {
            protocol: "http-get".into(),
            network: "*".into(),
            content_format: content_format.into(),
            additional_info: "*".into(),
        }
    }
}

impl fmt::Display for ProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.protocol, self.network, self.content_format, self.additional_info)
    }
}

impl FromStr for ProtocolInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(4, ':');
        let protocol = parts.next().ok_or_else(|| Error::InvalidArguments("empty ProtocolInfo".into()))?;
        let network = parts.next().ok_or_else(|| Error::InvalidArguments("malformed ProtocolInfo".into()))?;
        let content_format = parts.next().ok_or_else(|| Error::InvalidArguments("malformed ProtocolInfo".into()))?;
        let additional_info = parts.next().ok_or_else(|| Error::InvalidArguments("malformed ProtocolInfo".into()))?;
        Ok(Self {
            protocol: protocol.to_string(),
            network: network.to_string(),
            content_format: content_format.to_string(),
            additional_info: additional_info.to_string(),
        })
    }
}

/// Joins a comma-separated `ProtocolInfo` list as carried in
/// `Source/SinkProtocolInfo`.
pub fn join_protocol_infos(infos: &[ProtocolInfo]) -> String {
    infos.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "Input",
            Direction::Output => "Output",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub rcs_id: i32,
    pub av_transport_id: i32,
    pub protocol_info: ProtocolInfo,
    pub peer_connection_manager: String,
    pub peer_connection_id: i32,
    pub direction: Direction,
    pub status: String,
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
pub type Device = ServiceDevice<Traits>;

impl Client {
    pub async fn get_protocol_info(&self) -> Result<(Vec<ProtocolInfo>, Vec<ProtocolInfo>)> {
        let out = self.invoke("GetProtocolInfo", &[]).await?;
        let get = |name: &str| -> Result<Vec<ProtocolInfo>> {
            let raw = out
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or("");
            if raw.is_empty() {
                return Ok(Vec::new());
            }
            raw.split(',').map(ProtocolInfo::from_str).collect()
        };
        Ok((get("Source")?, get("Sink")?))
    }

    pub async fn get_current_connection_ids(&self) -> Result<Vec<i32>> {
        let out = self.invoke("GetCurrentConnectionIDs", &[]).await?;
        let raw = out
            .iter()
            .find(|(k, _)| k == "ConnectionIDs")
            .map(|(_, v)| v.as_str())
            .unwrap_or("");
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        raw.split(',')
            .map(|s| s.trim().parse::<i32>().map_err(|_| Error::InvalidArguments("bad ConnectionIDs".into())))
            .collect()
    }

    pub async fn get_current_connection_info(&self, connection_id: i32) -> Result<ConnectionInfo> {
        let out = self
            .invoke("GetCurrentConnectionInfo", &[("ConnectionID".into(), connection_id.to_string())])
            .await?;
        let field = |name: &str| out.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()).unwrap_or_default();
        Ok(ConnectionInfo {
            rcs_id: field("RcsID").parse().unwrap_or(-1),
            av_transport_id: field("AVTransportID").parse().unwrap_or(-1),
            protocol_info: ProtocolInfo::from_str(&field("ProtocolInfo")).unwrap_or(ProtocolInfo {
                protocol: "*".into(),
                network: "*".into(),
                content_format: "*".into(),
                additional_info: "*".into(),
            }),
            peer_connection_manager: field("PeerConnectionManager"),
            peer_connection_id: field("PeerConnectionID").parse().unwrap_or(-1),
            direction: if field("Direction") == "Output" { Direction::Output } else { Direction::Input },
            status: field("Status"),
        })
    }
}

impl Device {
    pub fn init(&self, source: &[ProtocolInfo], sink: &[ProtocolInfo]) {
        self.set_variable(0, "SourceProtocolInfo", join_protocol_infos(source));
        self.set_variable(0, "SinkProtocolInfo", join_protocol_infos(sink));
        self.set_variable(0, "CurrentConnectionIDs", "0");
    }

    pub fn source_protocol_info(&self) -> String {
        self.get_variable(0, "SourceProtocolInfo").unwrap_or_default()
    }

    pub fn sink_protocol_info(&self) -> String {
        self.get_variable(0, "SinkProtocolInfo").unwrap_or_default()
    }

    /// Executes one action synchronously (spec.md §5). `PrepareForConnection`
    /// and `ConnectionComplete` are optional per spec.md §4.7 and rejected
    /// as unsupported here; callers fall back to the fixed connection ID 0
    /// that `GetCurrentConnectionIDs`/`GetCurrentConnectionInfo` describe.
    pub fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, crate::soap::UpnpError> {
        match action {
            "GetProtocolInfo" => Ok(vec![
                ("Source".into(), self.source_protocol_info()),
                ("Sink".into(), self.sink_protocol_info()),
            ]),
            "GetCurrentConnectionIDs" => Ok(vec![("ConnectionIDs".into(), self.get_variable(0, "CurrentConnectionIDs").unwrap_or_else(|| "0".into()))]),
            "GetCurrentConnectionInfo" => {
                let connection_id: i32 = args
                    .iter()
                    .find(|(k, _)| k == "ConnectionID")
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("0")
                    .parse()
                    .map_err(|_| crate::soap::UpnpError::new(402, "invalid ConnectionID"))?;
                if connection_id != 0 {
                    return Err(crate::soap::UpnpError::new(701, "no such connection"));
                }
                Ok(vec![
                    ("RcsID".into(), "0".into()),
                    ("AVTransportID".into(), "0".into()),
                    ("ProtocolInfo".into(), ProtocolInfo { protocol: "*".into(), network: "*".into(), content_format: "*".into(), additional_info: "*".into() }.to_string()),
                    ("PeerConnectionManager".into(), "".into()),
                    ("PeerConnectionID".into(), "-1".into()),
                    ("Direction".into(), Direction::Input.to_string()),
                    ("Status".into(), "OK".into()),
                ])
            }
            "PrepareForConnection" | "ConnectionComplete" => Err(crate::soap::UpnpError::code_only(401)),
            _ => Err(crate::soap::UpnpError::code_only(401)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_info_round_trips() {
        let info = ProtocolInfo::http_get("audio/mpeg");
        let text = info.to_string();
        assert_eq!(text, "http-get:*:audio/mpeg:*");
        assert_eq!(ProtocolInfo::from_str(&text).unwrap(), info);
    }

    #[test]
    fn rejects_malformed_protocol_info() {
        assert!(ProtocolInfo::from_str("http-get:*").is_err());
    }

    #[test]
    fn dispatch_prepare_for_connection_is_unsupported() {
        let device = Device::new();
        device.init(&[ProtocolInfo::http_get("audio/mpeg")], &[]);
        let err = device.dispatch("PrepareForConnection", &[]).unwrap_err();
        assert_eq!(err.code, 401);
    }

    #[test]
    fn dispatch_get_current_connection_info_for_default_connection() {
        let device = Device::new();
        device.init(&[], &[]);
        let out = device
            .dispatch("GetCurrentConnectionInfo", &[("ConnectionID".to_string(), "0".to_string())])
            .unwrap();
        assert!(out.contains(&("Status".to_string(), "OK".to_string())));
    }

    #[test]
    fn dispatch_unknown_connection_id_faults() {
        let device = Device::new();
        device.init(&[], &[]);
        let err = device
            .dispatch("GetCurrentConnectionInfo", &[("ConnectionID".to_string(), "7".to_string())])
            .unwrap_err();
        assert_eq!(err.code, 701);
    }

    #[test]
    fn joins_multiple_protocol_infos() {
        let list = vec![ProtocolInfo::http_get("audio/mpeg"), ProtocolInfo::http_get("audio/flac")];
        assert_eq!(join_protocol_infos(&list), "http-get:*:audio/mpeg:*,http-get:*:audio/flac:*");
    }
}
