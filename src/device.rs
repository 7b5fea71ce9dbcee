//! Device description parsing (spec.md §3, §4.7 Root Device contract).
//!
//! `parse_device_description` is one of the two named XML operations the
//! core owns. Per the Open Question in spec.md §9, `SCPDURL`/`controlURL`/
//! `eventSubURL` are resolved to absolute URLs against the device's base URL
//! at parse time rather than carried as relative strings, so nothing
//! downstream needs to remember the base URL to make a request.

use crate::error::{Error, Result};
use crate::xml::{parse_xml_tree, XmlElement};
use url::Url;

#[derive(Debug, Clone)]
pub struct Service {
    pub service_type: String,
    pub service_id: String,
    pub control_url: Url,
    pub event_sub_url: Url,
    pub scpd_url: Url,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub friendly_name: String,
    pub device_type: String,
    pub udn: String,
    pub model_number: Option<String>,
    pub model_description: Option<String>,
    pub model_name: Option<String>,
    pub services: Vec<Service>,
    pub embedded_devices: Vec<Device>,
}

impl Device {
    /// Depth-first search for a service by type, matching the native
    /// resolution order: a device's own services before its embedded
    /// devices' services.
    pub fn find_service(&self, service_type: &str) -> Option<&Service> {
        if let Some(s) = self.services.iter().find(|s| s.service_type == service_type) {
            return Some(s);
        }
        self.embedded_devices
            .iter()
            .find_map(|d| d.find_service(service_type))
    }
}

/// Parses a UPnP device description document (the body fetched from the
/// device's `LOCATION` URL) rooted at `base_url`.
pub fn parse_device_description(xml: &str, base_url: &Url) -> Result<Device> {
    let root = parse_xml_tree(xml)?;
    let device_elem = root
        .find("device")
        .ok_or_else(|| Error::XmlDecode("missing <device>".into()))?;
    parse_device(device_elem, base_url)
}

fn parse_device(elem: &XmlElement, base_url: &Url) -> Result<Device> {
    let friendly_name = elem
        .child_text("friendlyName")
        .ok_or_else(|| Error::XmlDecode("missing friendlyName".into()))?
        .to_string();
    let device_type = elem
        .child_text("deviceType")
        .ok_or_else(|| Error::XmlDecode("missing deviceType".into()))?
        .to_string();
    let udn = elem
        .child_text("UDN")
        .ok_or_else(|| Error::XmlDecode("missing UDN".into()))?
        .to_string();

    let mut services = Vec::new();
    if let Some(list) = elem.find("serviceList") {
        for svc in list.find_all("service") {
            services.push(parse_service(svc, base_url)?);
        }
    }

    let mut embedded_devices = Vec::new();
    if let Some(list) = elem.find("deviceList") {
        for dev in list.find_all("device") {
            embedded_devices.push(parse_device(dev, base_url)?);
        }
    }

    Ok(Device {
        friendly_name,
        device_type,
        udn,
        model_number: elem.child_text("modelNumber").map(String::from),
        model_description: elem.child_text("modelDescription").map(String::from),
        model_name: elem.child_text("modelName").map(String::from),
        services,
        embedded_devices,
    })
}

fn parse_service(elem: &XmlElement, base_url: &Url) -> Result<Service> {
    let service_type = elem
        .child_text("serviceType")
        .ok_or_else(|| Error::XmlDecode("missing serviceType".into()))?
        .to_string();
    let service_id = elem
        .child_text("serviceId")
        .ok_or_else(|| Error::XmlDecode("missing serviceId".into()))?
        .to_string();
    let control_url = join(base_url, elem.child_text("controlURL"))?;
    let event_sub_url = join(base_url, elem.child_text("eventSubURL"))?;
    let scpd_url = join(base_url, elem.child_text("SCPDURL"))?;

    Ok(Service {
        service_type,
        service_id,
        control_url,
        event_sub_url,
        scpd_url,
    })
}

fn join(base_url: &Url, relative: Option<&str>) -> Result<Url> {
    let relative = relative.ok_or_else(|| Error::XmlDecode("missing URL field".into()))?;
    base_url.join(relative).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room</friendlyName>
    <UDN>uuid:1234</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/AVTransport/Control</controlURL>
        <eventSubURL>/AVTransport/Event</eventSubURL>
        <SCPDURL>/xml/AVTransport1.xml</SCPDURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
        <friendlyName>Living Room Media Server</friendlyName>
        <UDN>uuid:5678</UDN>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>
            <serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>
            <controlURL>/ContentDirectory/Control</controlURL>
            <eventSubURL>/ContentDirectory/Event</eventSubURL>
            <SCPDURL>/xml/ContentDirectory1.xml</SCPDURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn parses_device_and_resolves_urls() {
        let base: Url = "http://192.168.1.50:1400/description.xml".parse().unwrap();
        let device = parse_device_description(DEVICE_XML, &base).unwrap();
        assert_eq!(device.friendly_name, "Living Room");
        assert_eq!(device.services.len(), 1);
        assert_eq!(
            device.services[0].control_url.as_str(),
            "http://192.168.1.50:1400/AVTransport/Control"
        );
        assert_eq!(device.embedded_devices.len(), 1);
    }

    #[test]
    fn finds_service_in_embedded_device() {
        let base: Url = "http://192.168.1.50:1400/description.xml".parse().unwrap();
        let device = parse_device_description(DEVICE_XML, &base).unwrap();
        let svc = device
            .find_service("urn:schemas-upnp-org:service:ContentDirectory:1")
            .unwrap();
        assert_eq!(svc.service_id, "urn:upnp-org:serviceId:ContentDirectory");
    }

    #[test]
    fn missing_service_returns_none() {
        let base: Url = "http://192.168.1.50:1400/description.xml".parse().unwrap();
        let device = parse_device_description(DEVICE_XML, &base).unwrap();
        assert!(device.find_service("urn:schemas-upnp-org:service:NoSuchThing:1").is_none());
    }
}
