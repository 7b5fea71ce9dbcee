//! GENA event server (spec.md §4.4): the device-side half of eventing —
//! validating `SUBSCRIBE`/`UNSUBSCRIBE` requests, building the fixed
//! response bodies, and delivering `NOTIFY` requests to subscribers.
//! Grounded in the native device's GENA request handling.

use crate::error::{Error, Result};
use crate::http::{Client, Request};
use std::time::Duration;
use url::Url;

/// A well-formed `SUBSCRIBE` request for a brand new subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub callback_urls: Vec<Url>,
    pub timeout: Duration,
}

/// A well-formed `SUBSCRIBE` request renewing an existing one.
#[derive(Debug, Clone)]
pub struct RenewSubscription {
    pub sid: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum SubscriptionRequest {
    New(NewSubscription),
    Renew(RenewSubscription),
}

/// Parses the headers of a `SUBSCRIBE` request. A request carrying `SID` is
/// a renewal and ignores `NT`/`CALLBACK` entirely; one without `SID` must
/// carry both `NT: upnp:event` and at least one `CALLBACK` URL.
pub fn parse_subscribe_request(request: &Request) -> Result<SubscriptionRequest> {
    let timeout = match request.header("TIMEOUT") {
        Some(value) => parse_timeout_header(value)?,
        None => Duration::from_secs(1800),
    };

    if let Some(sid) = request.header("SID") {
        return Ok(SubscriptionRequest::Renew(RenewSubscription {
            sid: sid.to_string(),
            timeout,
        }));
    }

    let nt = request
        .header("NT")
        .ok_or_else(|| Error::MalformedHeader("missing NT".into()))?;
    if nt != "upnp:event" {
        return Err(Error::MalformedHeader(format!("unsupported NT: {nt}")));
    }
    let callback = request
        .header("CALLBACK")
        .ok_or_else(|| Error::MalformedHeader("missing CALLBACK".into()))?;
    let callback_urls = parse_callback_urls(callback)?;
    if callback_urls.is_empty() {
        return Err(Error::MalformedHeader("empty CALLBACK".into()));
    }

    Ok(SubscriptionRequest::New(NewSubscription {
        callback_urls,
        timeout,
    }))
}

/// Parses an `UNSUBSCRIBE` request: only the `SID` header matters, and the
/// native device rejects one carrying `NT`/`CALLBACK` as malformed rather
/// than tolerating it.
pub fn parse_unsubscribe_request(request: &Request) -> Result<String> {
    if request.header("NT").is_some() || request.header("CALLBACK").is_some() {
        return Err(Error::MalformedHeader(
            "UNSUBSCRIBE must not carry NT or CALLBACK".into(),
        ));
    }
    request
        .header("SID")
        .map(|s| s.to_string())
        .ok_or_else(|| Error::MalformedHeader("missing SID".into()))
}

/// Parses the `CALLBACK: <url1><url2>` header grammar.
pub fn parse_callback_urls(value: &str) -> Result<Vec<Url>> {
    let mut urls = Vec::new();
    let mut rest = value.trim();
    while let Some(start) = rest.find('<') {
        let after = &rest[start + 1..];
        let end = after
            .find('>')
            .ok_or_else(|| Error::MalformedHeader("unterminated CALLBACK URL".into()))?;
        let url_str = &after[..end];
        urls.push(url_str.parse::<Url>()?);
        rest = &after[end + 1..];
    }
    Ok(urls)
}

pub(crate) fn parse_timeout_header(value: &str) -> Result<Duration> {
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

pub(crate) fn format_timeout_header(timeout: Duration) -> String {
    if timeout.is_zero() {
        "Second-infinite".to_string()
    } else {
        format!("Second-{}", timeout.as_secs())
    }
}

/// Builds the `200 OK` response to a successful `SUBSCRIBE`.
pub fn subscribe_response(sid: &str, timeout: Duration) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nSID: {sid}\r\nTIMEOUT: {}\r\nCONTENT-LENGTH: 0\r\n\r\n",
        format_timeout_header(timeout)
    )
    .into_bytes()
}

/// Builds the `200 OK` response to a successful `UNSUBSCRIBE`.
pub fn unsubscribe_response() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\nCONTENT-LENGTH: 0\r\n\r\n".to_vec()
}

/// Builds the `200 OK` acknowledgement a subscriber's GENA listener sends
/// back for a `NOTIFY` it accepted.
pub fn notify_ack_response() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\nCONTENT-LENGTH: 0\r\n\r\n".to_vec()
}

/// Builds an `e:propertyset` body from an ordered list of
/// `(variable, value)` pairs. Each variable gets its own `e:property`
/// wrapper per the GENA wire format.
pub fn build_property_set(vars: &[(String, String)]) -> String {
    let mut inner = String::new();
    for (name, value) in vars {
        inner.push_str("<e:property><");
        inner.push_str(name);
        inner.push('>');
        inner.push_str(&crate::xml::xml_escape(value));
        inner.push_str("</");
        inner.push_str(name);
        inner.push_str("></e:property>");
    }
    format!(
        "<?xml version=\"1.0\"?><e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">{inner}</e:propertyset>"
    )
}

/// Parses an `e:propertyset` body into its `(variable, value)` pairs, in
/// document order, as delivered to a subscriber's callback URL.
pub fn parse_property_set(body: &str) -> Result<Vec<(String, String)>> {
    let tree = crate::xml::parse_xml_tree(body)?;
    let mut out = Vec::new();
    for property in tree.find_all("property") {
        if let Some(var) = property.children.first() {
            out.push((var.local_name().to_string(), var.text_trimmed().to_string()));
        }
    }
    Ok(out)
}

/// Advances a GENA sequence number: wraps from `u32::MAX` back to `1`,
/// never to `0` (spec.md §3 invariant — `0` is reserved for the initial
/// state event sent on subscribe).
pub fn next_seq(current: u32) -> u32 {
    if current == u32::MAX {
        1
    } else {
        current + 1
    }
}

/// Delivers `NOTIFY` requests to subscribers. Kept separate from the
/// request-parsing helpers above since it's the one part of GENA that
/// needs an outbound connection.
pub struct Notifier {
    http: Client,
}

impl Notifier {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }

    /// Sends a single `NOTIFY` to `callback_url`. Callers drive retries and
    /// subscription teardown on persistent failure; this just reports the
    /// one outcome.
    pub async fn notify(&self, callback_url: &Url, sid: &str, seq: u32, property_set: &str) -> Result<()> {
        let response = self
            .http
            .request(
                "NOTIFY",
                callback_url,
                &[
                    ("NT", "upnp:event"),
                    ("NTS", "upnp:propchange"),
                    ("SID", sid),
                    ("SEQ", &seq.to_string()),
                    ("CONTENT-TYPE", "text/xml; charset=\"utf-8\""),
                ],
                Some(property_set.as_bytes()),
            )
            .await?;

        if !response.is_success() {
            return Err(Error::Http(
                response.status,
                String::from_utf8_lossy(&response.body).into_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates an inbound `NOTIFY` request (the subscriber side of eventing):
/// checks `NT`/`NTS` and returns the `(sid, seq)` pair along with the parsed
/// property set. Per spec.md's Open Question resolution, a gap in `SEQ`
/// between consecutive notifications is not checked here — callers deliver
/// every `NOTIFY` they receive regardless of sequence continuity.
pub fn parse_notify_request(request: &Request) -> Result<(String, u32, Vec<(String, String)>)> {
    let nt = request
        .header("NT")
        .ok_or_else(|| Error::MalformedHeader("missing NT".into()))?;
    if nt != "upnp:event" {
        return Err(Error::MalformedHeader(format!("unsupported NT: {nt}")));
    }
    let nts = request
        .header("NTS")
        .ok_or_else(|| Error::MalformedHeader("missing NTS".into()))?;
    if nts != "upnp:propchange" {
        return Err(Error::MalformedHeader(format!("unsupported NTS: {nts}")));
    }
    let sid = request
        .header("SID")
        .ok_or_else(|| Error::MalformedHeader("missing SID".into()))?
        .to_string();
    let seq: u32 = request
        .header("SEQ")
        .ok_or_else(|| Error::MalformedHeader("missing SEQ".into()))?
        .parse()
        .map_err(|_| Error::MalformedHeader("malformed SEQ".into()))?;

    let body = String::from_utf8_lossy(&request.body);
    let vars = parse_property_set(&body)?;

    Ok((sid, seq, vars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Flags, Method};

    fn req(headers: &[(&str, &str)]) -> Request {
        Request {
            method: Method::Subscribe,
            url: "/event/0".into(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            body: Vec::new(),
            flags: Flags::empty(),
        }
    }

    #[test]
    fn parses_new_subscription() {
        let r = req(&[("NT", "upnp:event"), ("CALLBACK", "<http://10.0.0.2:1234/cb>"), ("TIMEOUT", "Second-1800")]);
        match parse_subscribe_request(&r).unwrap() {
            SubscriptionRequest::New(n) => {
                assert_eq!(n.callback_urls.len(), 1);
                assert_eq!(n.timeout, Duration::from_secs(1800));
            }
            _ => panic!("expected new subscription"),
        }
    }

    #[test]
    fn parses_renewal_ignoring_nt_callback() {
        let r = req(&[("SID", "uuid:abc"), ("TIMEOUT", "Second-300")]);
        match parse_subscribe_request(&r).unwrap() {
            SubscriptionRequest::Renew(ren) => {
                assert_eq!(ren.sid, "uuid:abc");
                assert_eq!(ren.timeout, Duration::from_secs(300));
            }
            _ => panic!("expected renewal"),
        }
    }

    #[test]
    fn rejects_new_subscription_missing_callback() {
        let r = req(&[("NT", "upnp:event")]);
        assert!(parse_subscribe_request(&r).is_err());
    }

    #[test]
    fn rejects_new_subscription_bad_nt() {
        let r = req(&[("NT", "bogus"), ("CALLBACK", "<http://x/>")]);
        assert!(parse_subscribe_request(&r).is_err());
    }

    #[test]
    fn parses_multiple_callback_urls() {
        let urls = parse_callback_urls("<http://a/1><http://b/2>").unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn seq_wraps_from_max_to_one() {
        assert_eq!(next_seq(u32::MAX), 1);
        assert_eq!(next_seq(0), 1);
        assert_eq!(next_seq(5), 6);
    }

    #[test]
    fn builds_and_parses_property_set() {
        let body = build_property_set(&[("Volume".into(), "10".into()), ("Mute".into(), "0".into())]);
        let parsed = parse_property_set(&body).unwrap();
        assert_eq!(parsed, vec![("Volume".to_string(), "10".to_string()), ("Mute".to_string(), "0".to_string())]);
    }
}
