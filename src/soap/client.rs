//! Outbound SOAP actions and GENA subscription requests (spec.md §4.3,
//! §4.4 client side). The native implementation lumps these together in
//! one class since both are just a handful of HTTP verbs over the same
//! pooled connection; this keeps that shape.

use crate::error::{Error, Result};
use crate::http::Client;
use crate::soap::envelope::{build_action_envelope, parse_action_response};
use crate::soap::fault::parse_fault;
use std::time::Duration;
use url::Url;

/// Result of a successful `SUBSCRIBE` or renewing `SUBSCRIBE`.
#[derive(Debug, Clone)]
pub struct SubscribeResult {
    pub sid: String,
    pub timeout: Option<Duration>,
}

pub struct SoapClient {
    http: Client,
}

impl SoapClient {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }

    /// Invokes `action` on `service_type` at `control_url`, returning its
    /// out-argument list or the `UPnPError` carried in the SOAP fault.
    pub async fn invoke_action(
        &self,
        control_url: &Url,
        service_type: &str,
        action: &str,
        args: &[(String, String)],
    ) -> Result<Vec<(String, String)>> {
        let envelope = build_action_envelope(service_type, action, args);
        let soap_action = format!("\"{service_type}#{action}\"");

        let response = self
            .http
            .request(
                "POST",
                control_url,
                &[
                    ("CONTENT-TYPE", "text/xml; charset=\"utf-8\""),
                    ("SOAPACTION", &soap_action),
                ],
                Some(envelope.as_bytes()),
            )
            .await?;

        if !response.is_success() {
            let body = String::from_utf8_lossy(&response.body);
            if let Some(fault) = parse_fault(&body) {
                return Err(Error::SoapFault {
                    code: fault.code,
                    description: fault.description.unwrap_or_default(),
                });
            }
            return Err(Error::Http(response.status, body.into_owned()));
        }

        let body = String::from_utf8_lossy(&response.body);
        parse_action_response(action, &body)
    }

    /// Subscribes `callback_url` to events published at `event_sub_url`.
    pub async fn subscribe(
        &self,
        event_sub_url: &Url,
        callback_url: &str,
        timeout: Duration,
    ) -> Result<SubscribeResult> {
        let callback_header = format!("<{callback_url}>");
        let timeout_header = format_timeout_header(timeout);
        let response = self
            .http
            .request(
                "SUBSCRIBE",
                event_sub_url,
                &[
                    ("CALLBACK", &callback_header),
                    ("NT", "upnp:event"),
                    ("TIMEOUT", &timeout_header),
                ],
                None,
            )
            .await?;

        parse_subscribe_response(&response)
    }

    /// Renews an existing subscription identified by `sid`.
    pub async fn renew(
        &self,
        event_sub_url: &Url,
        sid: &str,
        timeout: Duration,
    ) -> Result<SubscribeResult> {
        let timeout_header = format_timeout_header(timeout);
        let response = self
            .http
            .request(
                "SUBSCRIBE",
                event_sub_url,
                &[("SID", sid), ("TIMEOUT", &timeout_header)],
                None,
            )
            .await?;

        parse_subscribe_response(&response)
    }

    /// Cancels a subscription. Non-2xx responses are not treated as fatal
    /// since the device may already have expired the subscription.
    pub async fn unsubscribe(&self, event_sub_url: &Url, sid: &str) -> Result<()> {
        let _ = self
            .http
            .request("UNSUBSCRIBE", event_sub_url, &[("SID", sid)], None)
            .await?;
        Ok(())
    }
}

impl Default for SoapClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_subscribe_response(response: &crate::http::Response) -> Result<SubscribeResult> {
    if !response.is_success() {
        return Err(Error::Http(
            response.status,
            String::from_utf8_lossy(&response.body).into_owned(),
        ));
    }
    let sid = response
        .header("SID")
        .ok_or(Error::InvalidSubscriptionId)?
        .to_string();
    let timeout = match response.header("TIMEOUT") {
        Some(value) => Some(parse_timeout_header(value)?),
        None => None,
    };
    Ok(SubscribeResult { sid, timeout })
}

/// Renders the `TIMEOUT` header value the native implementation sends:
/// `Second-infinite` for a zero duration, else `Second-{n}`.
fn format_timeout_header(timeout: Duration) -> String {
    if timeout.is_zero() {
        "Second-infinite".to_string()
    } else {
        format!("Second-{}", timeout.as_secs())
    }
}

fn parse_timeout_header(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("Second-infinite") {
        return Ok(Duration::ZERO);
    }
    let secs = value
        .strip_prefix("Second-")
        .ok_or_else(|| Error::InvalidTimeoutHeader(value.to_string()))?
        .parse::<u64>()
        .map_err(|_| Error::InvalidTimeoutHeader(value.to_string()))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_finite_timeout() {
        assert_eq!(format_timeout_header(Duration::from_secs(1800)), "Second-1800");
    }

    #[test]
    fn formats_infinite_timeout() {
        assert_eq!(format_timeout_header(Duration::ZERO), "Second-infinite");
    }

    #[test]
    fn parses_finite_timeout() {
        assert_eq!(parse_timeout_header("Second-1800").unwrap(), Duration::from_secs(1800));
    }

    #[test]
    fn parses_infinite_timeout_as_zero() {
        assert_eq!(parse_timeout_header("Second-infinite").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_timeout() {
        assert!(parse_timeout_header("bogus").is_err());
    }
}
