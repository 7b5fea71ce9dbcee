//! SOAP action envelopes (spec.md §6): building outbound requests/responses
//! and parsing the argument list back out of whichever side receives one.

use crate::error::{Error, Result};
use crate::xml::{parse_xml_tree, xml_escape};

/// An action invocation parsed off the wire: the acting service's type URN,
/// the action name, and its ordered argument list.
#[derive(Debug, Clone)]
pub struct ParsedAction {
    pub service_type: String,
    pub action: String,
    pub args: Vec<(String, String)>,
}

fn build_envelope(service_type: &str, element: &str, args: &[(String, String)]) -> String {
    let mut body = format!("<u:{element} xmlns:u=\"{service_type}\">");
    for (name, value) in args {
        body.push('<');
        body.push_str(name);
        body.push('>');
        body.push_str(&xml_escape(value));
        body.push_str("</");
        body.push_str(name);
        body.push('>');
    }
    body.push_str(&format!("</u:{element}>"));

    format!(
        concat!(
            "<?xml version=\"1.0\"?>",
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">",
            "<s:Body>{}</s:Body></s:Envelope>"
        ),
        body
    )
}

/// Builds the request envelope a control point sends to invoke `action`.
pub fn build_action_envelope(service_type: &str, action: &str, args: &[(String, String)]) -> String {
    build_envelope(service_type, action, args)
}

/// Builds the response envelope a device writes back after executing
/// `action` successfully.
pub fn build_action_response_envelope(
    service_type: &str,
    action: &str,
    args: &[(String, String)],
) -> String {
    build_envelope(service_type, &format!("{action}Response"), args)
}

fn extract_action_element<'a>(
    envelope: &'a crate::xml::XmlElement,
) -> Result<&'a crate::xml::XmlElement> {
    let body = envelope
        .find("Body")
        .ok_or_else(|| Error::XmlDecode("missing s:Body".into()))?;
    body.children
        .first()
        .ok_or_else(|| Error::XmlDecode("empty s:Body".into()))
}

/// Parses an inbound `POST /control` body: the action name and namespace
/// come off the single child of `s:Body`, its children are the arguments.
pub fn parse_action_request(body: &str) -> Result<ParsedAction> {
    let envelope = parse_xml_tree(body)?;
    let action_elem = extract_action_element(&envelope)?;

    let service_type = action_elem
        .attrs
        .iter()
        .find(|(k, _)| k == "xmlns:u" || k == "xmlns")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let args = action_elem
        .children
        .iter()
        .map(|c| (c.local_name().to_string(), c.text_trimmed().to_string()))
        .collect();

    Ok(ParsedAction {
        service_type,
        action: action_elem.local_name().to_string(),
        args,
    })
}

/// Parses the argument list out of an action response envelope. `action` is
/// used only to sanity check the outer element name matches what was
/// invoked.
pub fn parse_action_response(action: &str, body: &str) -> Result<Vec<(String, String)>> {
    let envelope = parse_xml_tree(body)?;
    let action_elem = extract_action_element(&envelope)?;

    let expected = format!("{action}Response");
    if action_elem.local_name() != expected {
        return Err(Error::XmlDecode(format!(
            "expected <{expected}>, got <{}>",
            action_elem.local_name()
        )));
    }

    Ok(action_elem
        .children
        .iter()
        .map(|c| (c.local_name().to_string(), c.text_trimmed().to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_action_request_envelope() {
        let xml = build_action_envelope(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "Play",
            &[
                ("InstanceID".into(), "0".into()),
                ("Speed".into(), "1".into()),
            ],
        );
        assert!(xml.contains("<u:Play xmlns=\"urn:schemas-upnp-org:service:AVTransport:1\">")
            || xml.contains("xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\""));
        assert!(xml.contains("<InstanceID>0</InstanceID>"));
        assert!(xml.contains("<Speed>1</Speed>"));
    }

    #[test]
    fn round_trips_action_request() {
        let xml = build_action_envelope(
            "urn:schemas-upnp-org:service:ContentDirectory:1",
            "Browse",
            &[("ObjectID".into(), "0".into()), ("BrowseFlag".into(), "BrowseDirectChildren".into())],
        );
        let parsed = parse_action_request(&xml).unwrap();
        assert_eq!(parsed.action, "Browse");
        assert_eq!(parsed.service_type, "urn:schemas-upnp-org:service:ContentDirectory:1");
        assert_eq!(parsed.args, vec![
            ("ObjectID".to_string(), "0".to_string()),
            ("BrowseFlag".to_string(), "BrowseDirectChildren".to_string()),
        ]);
    }

    #[test]
    fn round_trips_action_response() {
        let xml = build_action_response_envelope(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "GetTransportInfo",
            &[("CurrentTransportState".into(), "PLAYING".into())],
        );
        let args = parse_action_response("GetTransportInfo", &xml).unwrap();
        assert_eq!(args, vec![("CurrentTransportState".to_string(), "PLAYING".to_string())]);
    }

    #[test]
    fn response_name_mismatch_is_rejected() {
        let xml = build_action_response_envelope(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "Play",
            &[],
        );
        assert!(parse_action_response("Stop", &xml).is_err());
    }

    #[test]
    fn escapes_argument_values() {
        let xml = build_action_envelope(
            "urn:schemas-upnp-org:service:ContentDirectory:1",
            "Browse",
            &[("Filter".into(), "a & b < c".into())],
        );
        assert!(xml.contains("<Filter>a &amp; b &lt; c</Filter>"));
    }
}
