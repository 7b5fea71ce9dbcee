//! Generic device-side service base (spec.md §4.6): the evented state
//! variable store plus the SUBSCRIBE/UNSUBSCRIBE/NOTIFY machinery shared by
//! all four concrete services. [`crate::last_change::LastChange`] sits on
//! top of this for the two services (AVTransport, RenderingControl) that
//! batch their events through a single `LastChange` variable; the other two
//! notify each variable change directly through [`ServiceDevice::notify_change`].

use crate::error::Result;
use crate::gena::{self, Notifier, SubscriptionRequest};
use crate::subscription::SubscriptionTable;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Identifies a concrete service for [`ServiceDevice`]: just its type and
/// ID URNs, as a zero-sized tag type.
pub trait DeviceServiceTraits: Send + Sync + 'static {
    const SERVICE_TYPE: &'static str;
    const SERVICE_ID: &'static str;
}

pub struct ServiceDevice<T: DeviceServiceTraits> {
    variables: Mutex<HashMap<(u32, String), String>>,
    subscriptions: Mutex<SubscriptionTable>,
    notifier: Notifier,
    _traits: PhantomData<T>,
}

impl<T: DeviceServiceTraits> ServiceDevice<T> {
    pub fn new() -> Self {
        Self {
            variables: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(SubscriptionTable::new()),
            notifier: Notifier::new(),
            _traits: PhantomData,
        }
    }

    /// Reads a state variable scoped to `instance_id` (spec.md §3: the core
    /// keeps `instance_id -> variable_name -> value`). Services with no
    /// `InstanceID` argument of their own (ConnectionManager,
    /// ContentDirectory) always use instance `0`.
    pub fn get_variable(&self, instance_id: u32, name: &str) -> Option<String> {
        self.variables
            .lock()
            .expect("variable store mutex poisoned")
            .get(&(instance_id, name.to_string()))
            .cloned()
    }

    /// Updates the in-memory value of a state variable scoped to
    /// `instance_id`. Callers decide separately whether and how to notify
    /// subscribers — directly via [`ServiceDevice::notify_change`], or
    /// batched through a [`crate::last_change::LastChange`] aggregator.
    pub fn set_variable(&self, instance_id: u32, name: impl Into<String>, value: impl Into<String>) {
        self.variables
            .lock()
            .expect("variable store mutex poisoned")
            .insert((instance_id, name.into()), value.into());
    }

    /// The full variable snapshot for one instance, used to seed a brand new
    /// subscriber's initial event.
    pub fn snapshot(&self, instance_id: u32) -> Vec<(String, String)> {
        self.variables
            .lock()
            .expect("variable store mutex poisoned")
            .iter()
            .filter(|((iid, _), _)| *iid == instance_id)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Handles a parsed `SUBSCRIBE` request: creates or renews a
    /// subscription and returns the `(SID, granted timeout)` pair to send
    /// back. A brand new subscription also gets its initial `SEQ=0` event
    /// dispatched (containing the full current variable snapshot) once the
    /// caller has written the response — spec.md §4.4 requires the `200
    /// OK` to precede the first `NOTIFY`.
    pub fn handle_subscribe(&self, request: &SubscriptionRequest) -> Result<(String, Duration)> {
        match request {
            SubscriptionRequest::New(new_sub) => {
                let sid = format!("uuid:{}", Uuid::new_v4());
                {
                    let mut subs = self.subscriptions.lock().expect("subscription table mutex poisoned");
                    subs.insert(sid.clone(), new_sub.callback_urls.clone(), new_sub.timeout);
                }
                Ok((sid, new_sub.timeout))
            }
            SubscriptionRequest::Renew(renewal) => {
                let mut subs = self.subscriptions.lock().expect("subscription table mutex poisoned");
                subs.renew(&renewal.sid, renewal.timeout)?;
                Ok((renewal.sid.clone(), renewal.timeout))
            }
        }
    }

    /// Sends the initial `SEQ=0` event to a freshly created subscription,
    /// carrying instance `0`'s variable snapshot (the instance every
    /// evented property reports to a subscriber that hasn't yet seen any
    /// per-instance state). Split out from [`ServiceDevice::handle_subscribe`]
    /// so the device can respond to the `SUBSCRIBE` request before this
    /// (network) step runs.
    pub async fn send_initial_event(&self, sid: &str) {
        let (callback_urls, seq) = {
            let subs = self.subscriptions.lock().expect("subscription table mutex poisoned");
            match subs.get(sid) {
                Some(sub) => (sub.callback_urls.clone(), sub.seq),
                None => return,
            }
        };
        let body = gena::build_property_set(&self.snapshot(0));
        for url in callback_urls {
            let _ = self.notifier.notify(&url, sid, seq, &body).await;
        }
    }

    pub fn handle_unsubscribe(&self, sid: &str) -> Result<()> {
        self.subscriptions.lock().expect("subscription table mutex poisoned").remove(sid);
        Ok(())
    }

    /// Drops every subscription whose renewal deadline has lapsed
    /// (spec.md §5: the publisher enforces subscription timeouts, not the
    /// subscriber). Called on a periodic sweep and before every delivery
    /// attempt so a lapsed subscriber never receives another event.
    pub fn sweep_expired_subscriptions(&self) {
        self.subscriptions
            .lock()
            .expect("subscription table mutex poisoned")
            .sweep_expired(std::time::Instant::now());
    }

    /// Notifies every active subscriber of `vars` directly (no batching).
    /// Returns whether every subscriber accepted the notification; a
    /// subscriber that can't be reached is dropped rather than retried.
    pub async fn notify_change(&self, vars: Vec<(String, String)>) -> bool {
        if vars.is_empty() {
            return true;
        }
        self.sweep_expired_subscriptions();
        let body = gena::build_property_set(&vars);
        let targets: Vec<(String, Vec<url::Url>)> = {
            let mut subs = self.subscriptions.lock().expect("subscription table mutex poisoned");
            let sids: Vec<String> = subs.iter().map(|s| s.sid.clone()).collect();
            sids.into_iter()
                .filter_map(|sid| {
                    subs.bump_seq(&sid)?;
                    let sub = subs.get(&sid)?;
                    Some((sid, sub.callback_urls.clone()))
                })
                .collect()
        };

        let mut all_ok = true;
        for (sid, urls) in targets {
            let seq = {
                let subs = self.subscriptions.lock().expect("subscription table mutex poisoned");
                subs.get(&sid).map(|s| s.seq).unwrap_or(0)
            };
            let mut delivered = false;
            for url in &urls {
                if self.notifier.notify(url, &sid, seq, &body).await.is_ok() {
                    delivered = true;
                }
            }
            if !delivered {
                all_ok = false;
                self.subscriptions.lock().expect("subscription table mutex poisoned").remove(&sid);
            }
        }
        all_ok
    }
}

impl<T: DeviceServiceTraits> Default for ServiceDevice<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTraits;
    impl DeviceServiceTraits for FakeTraits {
        const SERVICE_TYPE: &'static str = "urn:schemas-upnp-org:service:ConnectionManager:1";
        const SERVICE_ID: &'static str = "urn:upnp-org:serviceId:ConnectionManager";
    }

    #[test]
    fn variable_store_set_and_get() {
        let device: ServiceDevice<FakeTraits> = ServiceDevice::new();
        device.set_variable(0, "SourceProtocolInfo", "");
        assert_eq!(device.get_variable(0, "SourceProtocolInfo"), Some(String::new()));
        assert_eq!(device.get_variable(0, "NoSuchVar"), None);
    }

    #[test]
    fn variable_store_keeps_instances_separate() {
        let device: ServiceDevice<FakeTraits> = ServiceDevice::new();
        device.set_variable(0, "TransportState", "STOPPED");
        device.set_variable(1, "TransportState", "PLAYING");
        assert_eq!(device.get_variable(0, "TransportState"), Some("STOPPED".to_string()));
        assert_eq!(device.get_variable(1, "TransportState"), Some("PLAYING".to_string()));
    }

    #[test]
    fn new_subscription_gets_a_uuid_sid() {
        let device: ServiceDevice<FakeTraits> = ServiceDevice::new();
        let req = SubscriptionRequest::New(crate::gena::NewSubscription {
            callback_urls: vec!["http://10.0.0.2:1234/cb".parse().unwrap()],
            timeout: Duration::from_secs(1800),
        });
        let (sid, timeout) = device.handle_subscribe(&req).unwrap();
        assert!(sid.starts_with("uuid:"));
        assert_eq!(timeout, Duration::from_secs(1800));
    }

    #[test]
    fn renew_unknown_sid_fails() {
        let device: ServiceDevice<FakeTraits> = ServiceDevice::new();
        let req = SubscriptionRequest::Renew(crate::gena::RenewSubscription {
            sid: "uuid:nope".into(),
            timeout: Duration::from_secs(60),
        });
        assert!(device.handle_subscribe(&req).is_err());
    }

    #[test]
    fn sweep_removes_lapsed_subscription() {
        let device: ServiceDevice<FakeTraits> = ServiceDevice::new();
        let req = SubscriptionRequest::New(crate::gena::NewSubscription {
            callback_urls: vec!["http://10.0.0.2:1234/cb".parse().unwrap()],
            timeout: Duration::from_millis(10),
        });
        let (sid, _) = device.handle_subscribe(&req).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        device.sweep_expired_subscriptions();
        assert!(device.subscriptions.lock().unwrap().get(&sid).is_none());
    }
}
