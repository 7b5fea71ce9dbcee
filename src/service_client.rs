//! Generic control-point service client (spec.md §4.5), parameterized by a
//! `ServiceTraits` bundle instead of being templated per service: one value
//! type holds the service descriptor, the dispatch table of supported
//! actions, and a SOAP client, and the four concrete services in
//! [`crate::services`] each supply their own `Traits` impl.
//!
//! Grounded in the native `ServiceClientBase<Traits>`: actions are checked
//! against the SCPD-advertised action list before being sent, subscriptions
//! renew automatically at 75% of the granted timeout, and a renewal
//! failure tears the subscription down rather than being retried.
//!
//! The other half of spec.md §4.4/§4.5 lives here too: `subscribe` starts
//! (or reuses) a client-owned GENA listener — the native event callback
//! server — that turns inbound `NOTIFY` requests into [`SubscriptionEvent`]s
//! a caller drains through [`ServiceClient::next_event`].

use crate::device::Service;
use crate::error::{Error, Result};
use crate::gena;
use crate::http::server::{self, Request, Server};
use crate::http::Method;
use crate::soap::{SoapClient, SubscribeResult};
use crate::subscription::ClientSubscription;
use crate::xml::parse_xml_tree;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

/// Describes one UPnP service type for [`ServiceClient`]: just its type
/// URN, kept as a `const` on the implementor so each concrete service
/// (spec.md §4.7) is a zero-sized tag type rather than a runtime value.
pub trait ServiceTraits: Send + Sync + 'static {
    const SERVICE_TYPE: &'static str;
}

/// One delivered `NOTIFY`, parsed into its variable changes (spec.md §4.5:
/// "parses the body into a map variable -> value... fires a public
/// state-variable event"). `seq` is carried through unchecked for
/// continuity — a gap is not itself an error, per spec.md's Open Question
/// resolution on `SEQ`.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub sid: String,
    pub seq: u32,
    pub vars: Vec<(String, String)>,
}

/// A generic, SCPD-validated client for one instance of a UPnP service.
pub struct ServiceClient<T: ServiceTraits> {
    service: Service,
    soap: SoapClient,
    supported_actions: HashSet<String>,
    subscription: Arc<Mutex<Option<ClientSubscription>>>,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<Server>>,
    expected_sid: Arc<StdMutex<Option<String>>>,
    events_tx: mpsc::UnboundedSender<SubscriptionEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<SubscriptionEvent>>,
    _traits: std::marker::PhantomData<T>,
}

impl<T: ServiceTraits> ServiceClient<T> {
    /// Builds a client for `service`, fetching and parsing its SCPD
    /// document to populate the supported-action set.
    pub async fn connect(service: Service) -> Result<Self> {
        if service.service_type != T::SERVICE_TYPE {
            return Err(Error::UnsupportedService(service.service_type.clone()));
        }
        let soap = SoapClient::new();
        let supported_actions = fetch_supported_actions(&service.scpd_url).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            service,
            soap,
            supported_actions,
            subscription: Arc::new(Mutex::new(None)),
            renewal_task: Mutex::new(None),
            listener: Mutex::new(None),
            expected_sid: Arc::new(StdMutex::new(None)),
            events_tx,
            events_rx: Mutex::new(events_rx),
            _traits: std::marker::PhantomData,
        })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn supports_action(&self, action: &str) -> bool {
        self.supported_actions.contains(action)
    }

    /// Invokes `action`, rejecting it up front if the SCPD never advertised
    /// it rather than letting the device return a 401.
    pub async fn invoke(&self, action: &str, args: &[(String, String)]) -> Result<Vec<(String, String)>> {
        if !self.supports_action(action) {
            return Err(Error::UnsupportedAction(action.to_string()));
        }
        self.soap
            .invoke_action(&self.service.control_url, T::SERVICE_TYPE, action, args)
            .await
    }

    /// Subscribes for events and spawns the background renewal loop. Only
    /// one subscription is tracked per client; a second call replaces it.
    ///
    /// Starts the GENA event listener on `bind_addr` the first time it's
    /// called (a later call reuses the already-bound address) and registers
    /// its URL as the `CALLBACK` the device will `NOTIFY`.
    pub async fn subscribe(&self, bind_addr: SocketAddr, timeout: Duration) -> Result<SubscribeResult> {
        let callback_url = self.ensure_listener(bind_addr).await?;
        let result = self
            .soap
            .subscribe(&self.service.event_sub_url, &callback_url, timeout)
            .await?;

        let granted = result.timeout.unwrap_or(timeout);
        let sub = ClientSubscription::new(result.sid.clone(), self.service.event_sub_url.clone(), granted);
        *self.subscription.lock().await = Some(sub);
        *self.expected_sid.lock().expect("expected_sid mutex poisoned") = Some(result.sid.clone());

        self.spawn_renewal_loop(granted);
        Ok(result)
    }

    /// Starts the client-owned GENA listener if it isn't already running,
    /// returning its `CALLBACK` URL either way.
    async fn ensure_listener(&self, bind_addr: SocketAddr) -> Result<String> {
        let mut guard = self.listener.lock().await;
        if let Some(server) = guard.as_ref() {
            return Ok(format!("http://{}/", server.get_address()));
        }

        let server = Server::start(bind_addr).await?;
        let expected_sid = self.expected_sid.clone();
        let tx = self.events_tx.clone();
        server
            .set_request_handler(
                Method::Notify,
                Arc::new(move |req: &Request| handle_notify(req, &expected_sid, &tx)),
            )
            .await;

        let callback_url = format!("http://{}/", server.get_address());
        *guard = Some(server);
        Ok(callback_url)
    }

    /// Waits for the next delivered event. Returns `None` once the client
    /// (and its event sender) has been dropped.
    pub async fn next_event(&self) -> Option<SubscriptionEvent> {
        self.events_rx.lock().await.recv().await
    }

    fn spawn_renewal_loop(&self, mut timeout: Duration) {
        let subscription = self.subscription.clone();
        let event_sub_url = self.service.event_sub_url.clone();

        let handle = tokio::spawn(async move {
            loop {
                let renew_after = if timeout.is_zero() {
                    return;
                } else {
                    timeout.mul_f64(0.75)
                };
                tokio::time::sleep(renew_after).await;

                let sid = match subscription.lock().await.as_ref() {
                    Some(s) => s.sid.clone(),
                    None => return,
                };

                let soap = SoapClient::new();
                match soap.renew(&event_sub_url, &sid, timeout).await {
                    Ok(result) => {
                        let granted = result.timeout.unwrap_or(timeout);
                        if let Some(sub) = subscription.lock().await.as_mut() {
                            sub.renew(granted);
                        }
                        timeout = granted;
                    }
                    Err(_) => {
                        // Renewal failures are not retried; the subscription
                        // is considered lost and the loop exits.
                        *subscription.lock().await = None;
                        return;
                    }
                }
            }
        });

        // Replacing any previous handle is fine; dropping a JoinHandle
        // doesn't abort the task, so we keep it around to abort explicitly
        // on unsubscribe.
        if let Ok(mut guard) = self.renewal_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Cancels the active subscription, if any, and stops its renewal loop.
    /// The GENA listener itself is left running so a later `subscribe` can
    /// reuse its address; a `NOTIFY` that arrives after this point is
    /// rejected since no SID is expected anymore.
    pub async fn unsubscribe(&self) -> Result<()> {
        let sid = match self.subscription.lock().await.take() {
            Some(sub) => sub.sid,
            None => return Ok(()),
        };
        *self.expected_sid.lock().expect("expected_sid mutex poisoned") = None;
        if let Some(task) = self.renewal_task.lock().await.take() {
            task.abort();
        }
        self.soap.unsubscribe(&self.service.event_sub_url, &sid).await
    }

    pub async fn current_subscription_sid(&self) -> Option<String> {
        self.subscription.lock().await.as_ref().map(|s| s.sid.clone())
    }
}

/// Handles one inbound `NOTIFY` on the client-owned GENA listener: parses it,
/// checks it against the SID this client currently expects, and hands it
/// off to the event channel. A `NOTIFY` for any other SID is rejected
/// rather than silently delivered — most likely a stale device still
/// targeting a subscription this client already tore down.
fn handle_notify(req: &Request, expected_sid: &StdMutex<Option<String>>, tx: &mpsc::UnboundedSender<SubscriptionEvent>) -> Vec<u8> {
    let (sid, seq, vars) = match gena::parse_notify_request(req) {
        Ok(parsed) => parsed,
        Err(_) => return server::error_response(400, "Bad Request"),
    };

    let expected = expected_sid.lock().expect("expected_sid mutex poisoned").clone();
    if expected.as_deref() != Some(sid.as_str()) {
        return server::error_response(412, "Precondition Failed");
    }

    let _ = tx.send(SubscriptionEvent { sid, seq, vars });
    gena::notify_ack_response()
}

async fn fetch_supported_actions(scpd_url: &Url) -> Result<HashSet<String>> {
    let client = crate::http::Client::new();
    let response = client.request("GET", scpd_url, &[], None).await?;
    if !response.is_success() {
        return Err(Error::Http(response.status, "failed to fetch SCPD".into()));
    }
    let body = String::from_utf8_lossy(&response.body);
    let scpd = parse_xml_tree(&body)?;
    let mut actions = HashSet::new();
    if let Some(list) = scpd.find("actionList") {
        for action in list.find_all("action") {
            if let Some(name) = action.child_text("name") {
                actions.insert(name.to_string());
            }
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTraits;
    impl ServiceTraits for FakeTraits {
        const SERVICE_TYPE: &'static str = "urn:schemas-upnp-org:service:AVTransport:1";
    }

    #[test]
    fn service_traits_expose_service_type() {
        assert_eq!(FakeTraits::SERVICE_TYPE, "urn:schemas-upnp-org:service:AVTransport:1");
    }

    #[test]
    fn parses_action_list_from_scpd() {
        let scpd = r#"<scpd><actionList><action><name>Play</name></action><action><name>Stop</name></action></actionList></scpd>"#;
        let tree = parse_xml_tree(scpd).unwrap();
        let list = tree.find("actionList").unwrap();
        let names: Vec<_> = list.find_all("action").filter_map(|a| a.child_text("name")).collect();
        assert_eq!(names, vec!["Play", "Stop"]);
    }

    #[tokio::test]
    async fn subscribe_delivers_notify_as_event() {
        use crate::device::Service as DeviceService;
        use crate::root_device::{RootDevice, ServiceMount};
        use crate::services::connection_manager;
        use std::net::{IpAddr, Ipv4Addr};

        fn loopback() -> SocketAddr {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
        }

        let scpd_server = server::Server::start(loopback()).await.unwrap();
        let scpd_xml = br#"<scpd><actionList><action><name>GetProtocolInfo</name></action></actionList></scpd>"#.to_vec();
        scpd_server.add_file("/cm.xml", "text/xml", scpd_xml).await;
        let scpd_addr = scpd_server.get_address();

        let device = Arc::new(connection_manager::Device::new());
        device.init(&[], &[]);
        let mount = ServiceMount::new("/cm/control", "/cm/event", device.clone());
        let root = RootDevice::start(loopback(), b"<root/>".to_vec(), vec![mount]).await.unwrap();
        let root_addr = root.get_address();

        let service = DeviceService {
            service_type: connection_manager::SERVICE_TYPE.to_string(),
            service_id: connection_manager::SERVICE_ID.to_string(),
            control_url: format!("http://{root_addr}/cm/control").parse().unwrap(),
            event_sub_url: format!("http://{root_addr}/cm/event").parse().unwrap(),
            scpd_url: format!("http://{scpd_addr}/cm.xml").parse().unwrap(),
        };

        let client = connection_manager::Client::connect(service).await.unwrap();
        client.subscribe(loopback(), Duration::from_secs(1800)).await.unwrap();
        let sid = client.current_subscription_sid().await.unwrap();

        device
            .notify_change(vec![("SourceProtocolInfo".to_string(), "http-get:*:audio/mpeg:*".to_string())])
            .await;

        let mut found = false;
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), client.next_event()).await.unwrap().unwrap();
            assert_eq!(event.sid, sid);
            if event.vars.iter().any(|(k, v)| k == "SourceProtocolInfo" && v == "http-get:*:audio/mpeg:*") {
                found = true;
                break;
            }
        }
        assert!(found, "expected to observe the manually-notified variable change");

        root.stop(|| {}).await;
        scpd_server.stop(|| {}).await;
    }

    #[tokio::test]
    async fn notify_with_unknown_sid_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let expected_sid: StdMutex<Option<String>> = StdMutex::new(Some("uuid:known".to_string()));
        let req = Request {
            method: crate::http::Method::Notify,
            url: "/".to_string(),
            headers: vec![
                ("NT".to_string(), "upnp:event".to_string()),
                ("NTS".to_string(), "upnp:propchange".to_string()),
                ("SID".to_string(), "uuid:other".to_string()),
                ("SEQ".to_string(), "1".to_string()),
            ],
            body: gena::build_property_set(&[]).into_bytes(),
            flags: crate::http::Flags::empty(),
        };
        let response = handle_notify(&req, &expected_sid, &tx);
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 412"));
    }
}
