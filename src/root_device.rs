//! Root device (spec.md §4.7): owns the HTTP server, hosts the device
//! description document, and routes `POST` (action), `SUBSCRIBE`, and
//! `UNSUBSCRIBE` requests to whichever concrete service's control/event-sub
//! path they target. [`http::server::Handler`] is keyed by HTTP method only,
//! so all the path-based routing happens inside the three handlers below.

use crate::error::Result;
use crate::gena::{self, SubscriptionRequest};
use crate::http::server::{self, Request, Server};
use crate::http::Method;
use crate::soap::{self, UpnpError};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Common device-side surface every concrete service exposes, erased so
/// [`RootDevice`] can route to any of the four without knowing their
/// concrete `ServiceDevice<T>` instantiation.
pub trait DeviceService: Send + Sync {
    fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, UpnpError>;
    fn handle_subscribe(&self, request: &SubscriptionRequest) -> Result<(String, Duration)>;
    fn handle_unsubscribe(&self, sid: &str) -> Result<()>;
    fn send_initial_event<'a>(&'a self, sid: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn sweep_expired_subscriptions(&self);
}

impl DeviceService for crate::services::connection_manager::Device {
    fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, UpnpError> {
        crate::services::connection_manager::Device::dispatch(self, action, args)
    }

    fn handle_subscribe(&self, request: &SubscriptionRequest) -> Result<(String, Duration)> {
        crate::service_device::ServiceDevice::handle_subscribe(self, request)
    }

    fn handle_unsubscribe(&self, sid: &str) -> Result<()> {
        crate::service_device::ServiceDevice::handle_unsubscribe(self, sid)
    }

    fn send_initial_event<'a>(&'a self, sid: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(crate::service_device::ServiceDevice::send_initial_event(self, sid))
    }

    fn sweep_expired_subscriptions(&self) {
        crate::service_device::ServiceDevice::sweep_expired_subscriptions(self)
    }
}

macro_rules! impl_device_service_via_base {
    ($ty:path) => {
        impl DeviceService for $ty {
            fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, UpnpError> {
                self.dispatch(action, args)
            }

            fn handle_subscribe(&self, request: &SubscriptionRequest) -> Result<(String, Duration)> {
                self.base().handle_subscribe(request)
            }

            fn handle_unsubscribe(&self, sid: &str) -> Result<()> {
                self.base().handle_unsubscribe(sid)
            }

            fn send_initial_event<'a>(&'a self, sid: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
                Box::pin(self.base().send_initial_event(sid))
            }

            fn sweep_expired_subscriptions(&self) {
                self.base().sweep_expired_subscriptions()
            }
        }
    };
}

impl_device_service_via_base!(crate::services::content_directory::Device);
impl_device_service_via_base!(crate::services::av_transport::Device);
impl_device_service_via_base!(crate::services::rendering_control::Device);

/// Binds one concrete service to the paths its control point sees in the
/// device description (spec.md §3: control/event-sub URLs resolved at
/// parse time, so the same paths are used on both sides).
#[derive(Clone)]
pub struct ServiceMount {
    pub control_path: String,
    pub event_sub_path: String,
    pub service: Arc<dyn DeviceService>,
}

impl ServiceMount {
    pub fn new(control_path: impl Into<String>, event_sub_path: impl Into<String>, service: Arc<dyn DeviceService>) -> Self {
        Self {
            control_path: control_path.into(),
            event_sub_path: event_sub_path.into(),
            service,
        }
    }
}

struct Shared {
    mounts: Vec<ServiceMount>,
}

/// Hosts a device description document and dispatches control/event
/// traffic to the services mounted on it (spec.md §4.7).
/// How often the background sweep checks every mounted service for lapsed
/// subscriptions (spec.md §5: enforcement is the publisher's job, run on its
/// own clock rather than on the next event each service happens to emit).
const SUBSCRIPTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct RootDevice {
    server: Server,
    #[allow(dead_code)]
    shared: Arc<Shared>,
    sweep_task: tokio::task::JoinHandle<()>,
}

impl RootDevice {
    /// Starts the HTTP server, hosts `description_xml` at `/description.xml`,
    /// and installs routing for every mount.
    pub async fn start(addr: SocketAddr, description_xml: Vec<u8>, mounts: Vec<ServiceMount>) -> Result<Self> {
        let server = Server::start(addr).await?;
        server.add_file("/description.xml", "text/xml", description_xml).await;

        let shared = Arc::new(Shared { mounts });

        let post_shared = shared.clone();
        server
            .set_request_handler(Method::Post, Arc::new(move |req: &Request| handle_post(&post_shared, req)))
            .await;

        let sub_shared = shared.clone();
        server
            .set_request_handler(Method::Subscribe, Arc::new(move |req: &Request| handle_subscribe(&sub_shared, req)))
            .await;

        let unsub_shared = shared.clone();
        server
            .set_request_handler(Method::Unsubscribe, Arc::new(move |req: &Request| handle_unsubscribe(&unsub_shared, req)))
            .await;

        let sweep_shared = shared.clone();
        let sweep_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SUBSCRIPTION_SWEEP_INTERVAL).await;
                for mount in &sweep_shared.mounts {
                    mount.service.sweep_expired_subscriptions();
                }
            }
        });

        Ok(Self { server, shared, sweep_task })
    }

    pub fn get_address(&self) -> SocketAddr {
        self.server.get_address()
    }

    pub async fn stop(self, cb: impl FnOnce() + Send + 'static) {
        self.sweep_task.abort();
        self.server.stop(cb).await;
    }
}

fn handle_post(shared: &Arc<Shared>, req: &Request) -> Vec<u8> {
    let mount = match shared.mounts.iter().find(|m| m.control_path == req.url) {
        Some(m) => m,
        None => return server::error_response(404, "Not Found"),
    };

    let body = String::from_utf8_lossy(&req.body);
    let parsed = match soap::parse_action_request(&body) {
        Ok(parsed) => parsed,
        Err(_) => return soap_fault_response(UpnpError::code_only(401)),
    };

    match mount.service.dispatch(&parsed.action, &parsed.args) {
        Ok(out) => {
            let xml = soap::build_action_response_envelope(&parsed.service_type, &parsed.action, &out);
            xml_ok_response(&xml)
        }
        Err(fault) => soap_fault_response(fault),
    }
}

/// Handles `SUBSCRIBE` synchronously, then — for a brand new subscription —
/// spawns the initial `SEQ=0` NOTIFY once this function returns, so the
/// `200 OK` is written to the wire first (spec.md §4.7).
fn handle_subscribe(shared: &Arc<Shared>, req: &Request) -> Vec<u8> {
    let mount = match shared.mounts.iter().find(|m| m.event_sub_path == req.url) {
        Some(m) => m.clone(),
        None => return server::error_response(404, "Not Found"),
    };

    let parsed = match gena::parse_subscribe_request(req) {
        Ok(parsed) => parsed,
        Err(_) => return server::error_response(400, "Bad Request"),
    };
    let is_new = matches!(parsed, SubscriptionRequest::New(_));

    match mount.service.handle_subscribe(&parsed) {
        Ok((sid, timeout)) => {
            let response = gena::subscribe_response(&sid, timeout);
            if is_new {
                let service = mount.service.clone();
                tokio::spawn(async move {
                    service.send_initial_event(&sid).await;
                });
            }
            response
        }
        Err(_) => server::error_response(412, "Precondition Failed"),
    }
}

fn handle_unsubscribe(shared: &Arc<Shared>, req: &Request) -> Vec<u8> {
    let mount = match shared.mounts.iter().find(|m| m.event_sub_path == req.url) {
        Some(m) => m,
        None => return server::error_response(404, "Not Found"),
    };

    let sid = match gena::parse_unsubscribe_request(req) {
        Ok(sid) => sid,
        Err(_) => return server::error_response(400, "Bad Request"),
    };

    match mount.service.handle_unsubscribe(&sid) {
        Ok(()) => gena::unsubscribe_response(),
        Err(_) => server::error_response(412, "Precondition Failed"),
    }
}

fn xml_ok_response(xml: &str) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nCONTENT-TYPE: text/xml; charset=\"utf-8\"\r\nCONTENT-LENGTH: {}\r\n\r\n",
        xml.len()
    )
    .into_bytes();
    out.extend_from_slice(xml.as_bytes());
    out
}

fn soap_fault_response(err: UpnpError) -> Vec<u8> {
    let body = err.to_body();
    let mut out = format!(
        "HTTP/1.1 500 Internal Server Error\r\nCONTENT-TYPE: text/xml; charset=\"utf-8\"\r\nCONTENT-LENGTH: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection_manager;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn hosts_device_description() {
        let root = RootDevice::start(local_addr(), b"<root/>".to_vec(), Vec::new()).await.unwrap();
        let addr = root.get_address();
        let client = crate::http::client::Client::new();
        let url: url::Url = format!("http://{addr}/description.xml").parse().unwrap();
        let resp = client.request("GET", &url, &[], None).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"<root/>");
        root.stop(|| {}).await;
    }

    #[tokio::test]
    async fn routes_post_to_mounted_service() {
        let cm = Arc::new(connection_manager::Device::new());
        cm.init(&[connection_manager::ProtocolInfo::http_get("audio/mpeg")], &[]);
        let mount = ServiceMount::new("/cm/control", "/cm/event", cm);

        let root = RootDevice::start(local_addr(), b"<root/>".to_vec(), vec![mount]).await.unwrap();
        let addr = root.get_address();

        let client = crate::http::client::Client::new();
        let url: url::Url = format!("http://{addr}/cm/control").parse().unwrap();
        let body = soap::build_action_envelope(connection_manager::SERVICE_TYPE, "GetProtocolInfo", &[]);
        let resp = client
            .request(
                "POST",
                &url,
                &[("CONTENT-TYPE", "text/xml; charset=\"utf-8\""), ("SOAPACTION", "\"#GetProtocolInfo\"")],
                Some(body.as_bytes()),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        let out = soap::parse_action_response("GetProtocolInfo", &String::from_utf8_lossy(&resp.body)).unwrap();
        assert!(out.iter().any(|(k, v)| k == "Source" && v.contains("audio/mpeg")));

        root.stop(|| {}).await;
    }

    #[tokio::test]
    async fn unknown_control_path_is_404() {
        let root = RootDevice::start(local_addr(), b"<root/>".to_vec(), Vec::new()).await.unwrap();
        let addr = root.get_address();
        let client = crate::http::client::Client::new();
        let url: url::Url = format!("http://{addr}/nope").parse().unwrap();
        let resp = client.request("POST", &url, &[], Some(b"")).await.unwrap();
        assert_eq!(resp.status, 404);
        root.stop(|| {}).await;
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_round_trips() {
        let cm = Arc::new(connection_manager::Device::new());
        cm.init(&[], &[]);
        let mount = ServiceMount::new("/cm/control", "/cm/event", cm);
        let root = RootDevice::start(local_addr(), b"<root/>".to_vec(), vec![mount]).await.unwrap();
        let addr = root.get_address();

        let client = crate::http::client::Client::new();
        let url: url::Url = format!("http://{addr}/cm/event").parse().unwrap();
        let resp = client
            .request(
                "SUBSCRIBE",
                &url,
                &[("NT", "upnp:event"), ("CALLBACK", "<http://127.0.0.1:1/cb>"), ("TIMEOUT", "Second-1800")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        let sid = resp.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("SID")).map(|(_, v)| v.clone()).unwrap();

        let resp = client.request("UNSUBSCRIBE", &url, &[("SID", &sid)], None).await.unwrap();
        assert_eq!(resp.status, 200);

        root.stop(|| {}).await;
    }
}
