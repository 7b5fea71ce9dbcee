//! SOAP fault bodies (spec.md §6). Mirrors the two fixed fault shapes the
//! native device emits: with and without an `errorDescription` element.

use crate::xml::{parse_xml_tree, xml_escape};

/// A UPnP error as carried inside a SOAP `<s:Fault>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpError {
    pub code: u16,
    pub description: Option<String>,
}

impl UpnpError {
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }

    pub fn code_only(code: u16) -> Self {
        Self {
            code,
            description: None,
        }
    }

    /// Renders the SOAP envelope body for this fault, exactly as the native
    /// device writes it: a `faultcode`/`faultstring` pair fixed at
    /// `s:Client`/`UPnPError`, with the detail block carrying the numeric
    /// code and, when present, a human description.
    pub fn to_body(&self) -> String {
        let detail_inner = match &self.description {
            Some(desc) => format!(
                "<errorCode>{}</errorCode><errorDescription>{}</errorDescription>",
                self.code,
                xml_escape(desc)
            ),
            None => format!("<errorCode>{}</errorCode>", self.code),
        };

        format!(
            concat!(
                "<?xml version=\"1.0\"?>",
                "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
                "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">",
                "<s:Body><s:Fault>",
                "<faultcode>s:Client</faultcode>",
                "<faultstring>UPnPError</faultstring>",
                "<detail><UPnPError xmlns=\"urn:schemas-upnp-org:control-1-0\">{}</UPnPError></detail>",
                "</s:Fault></s:Body></s:Envelope>"
            ),
            detail_inner
        )
    }
}

/// Parses a SOAP fault out of a full envelope body. Returns `None` if the
/// document isn't a fault (callers should fall back to treating the body as
/// a normal action response).
pub fn parse_fault(xml: &str) -> Option<UpnpError> {
    let envelope = parse_xml_tree(xml).ok()?;
    let body = envelope.find("Body")?;
    let fault = body.find("Fault")?;
    let detail = fault.find("detail")?;
    let upnp_error = detail.find("UPnPError")?;

    let code = upnp_error.child_text("errorCode")?.trim().parse().ok()?;
    let description = upnp_error
        .child_text("errorDescription")
        .map(|s| s.trim().to_string());

    Some(UpnpError { code, description })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_fault_with_description() {
        let err = UpnpError::new(402, "Invalid Args");
        let body = err.to_body();
        assert!(body.contains("<errorCode>402</errorCode>"));
        assert!(body.contains("<errorDescription>Invalid Args</errorDescription>"));
    }

    #[test]
    fn renders_fault_without_description() {
        let err = UpnpError::code_only(501);
        let body = err.to_body();
        assert!(body.contains("<errorCode>501</errorCode>"));
        assert!(!body.contains("errorDescription"));
    }

    #[test]
    fn round_trips_fault() {
        let err = UpnpError::new(701, "Transition not available");
        let body = err.to_body();
        let parsed = parse_fault(&body).unwrap();
        assert_eq!(parsed.code, 701);
        assert_eq!(parsed.description.as_deref(), Some("Transition not available"));
    }

    #[test]
    fn non_fault_body_returns_none() {
        let body = "<s:Envelope><s:Body><u:BrowseResponse/></s:Body></s:Envelope>";
        assert!(parse_fault(body).is_none());
    }
}
