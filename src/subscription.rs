//! Subscription state (spec.md §3, §9). The device side uses the slab +
//! index pattern called out in the design notes: subscriptions and their
//! renewal deadlines reference each other, and a slab removes the need to
//! chase raw cross-references by hand when one side tears down.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use url::Url;

/// A small slab allocator: stable indices, O(1) insert/remove, no shifting.
#[derive(Debug, Default)]
struct Slab<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slab<T> {
    fn new() -> Self {
        Self { items: Vec::new(), free: Vec::new() }
    }

    fn insert(&mut self, value: T) -> usize {
        if let Some(idx) = self.free.pop() {
            self.items[idx] = Some(value);
            idx
        } else {
            self.items.push(Some(value));
            self.items.len() - 1
        }
    }

    fn remove(&mut self, idx: usize) -> Option<T> {
        let slot = self.items.get_mut(idx)?;
        let value = slot.take()?;
        self.free.push(idx);
        Some(value)
    }

    fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)?.as_ref()
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.items.get_mut(idx)?.as_mut()
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
    }
}

/// One device-side subscriber: the callback URL(s) it registered, its
/// current `SEQ` counter, and its renewal deadline.
#[derive(Debug, Clone)]
pub struct DeviceSubscription {
    pub sid: String,
    pub callback_urls: Vec<Url>,
    pub seq: u32,
    pub expires_at: Instant,
}

/// The deadline a device-side subscription expires at. `Duration::ZERO`
/// carries `SECOND-INFINITE` (spec.md §6): no expiry, modeled as a deadline
/// far enough out that no sweep will ever observe it as lapsed.
fn device_renewal_deadline(timeout: Duration) -> Instant {
    if timeout.is_zero() {
        return Instant::now() + Duration::from_secs(365 * 24 * 3600);
    }
    Instant::now() + timeout
}

/// All subscribers of one device-side service, indexed both by slab slot
/// (stable across renewals) and by SID (what arrives on the wire).
#[derive(Default)]
pub struct SubscriptionTable {
    slab: Slab<DeviceSubscription>,
    by_sid: HashMap<String, usize>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self { slab: Slab::new(), by_sid: HashMap::new() }
    }

    pub fn insert(&mut self, sid: String, callback_urls: Vec<Url>, timeout: Duration) -> &DeviceSubscription {
        let idx = self.slab.insert(DeviceSubscription {
            sid: sid.clone(),
            callback_urls,
            seq: 0,
            expires_at: device_renewal_deadline(timeout),
        });
        self.by_sid.insert(sid, idx);
        self.slab.get(idx).expect("just inserted")
    }

    /// Renews `sid` against a fresh deadline. Rejects a renewal that arrives
    /// after the subscription has already lapsed (spec.md §5: the publisher,
    /// not the subscriber, enforces the timeout) rather than quietly
    /// reviving it.
    pub fn renew(&mut self, sid: &str, timeout: Duration) -> Result<()> {
        let idx = *self.by_sid.get(sid).ok_or(Error::InvalidSubscriptionId)?;
        let sub = self.slab.get_mut(idx).ok_or(Error::InvalidSubscriptionId)?;
        if sub.expires_at <= Instant::now() {
            return Err(Error::InvalidSubscriptionId);
        }
        sub.expires_at = device_renewal_deadline(timeout);
        Ok(())
    }

    /// Drops every subscription whose deadline has passed as of `now`,
    /// returning the SIDs removed.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let sids = self.expired(now);
        for sid in &sids {
            self.remove(sid);
        }
        sids
    }

    pub fn remove(&mut self, sid: &str) -> Option<DeviceSubscription> {
        let idx = self.by_sid.remove(sid)?;
        self.slab.remove(idx)
    }

    pub fn get(&self, sid: &str) -> Option<&DeviceSubscription> {
        let idx = *self.by_sid.get(sid)?;
        self.slab.get(idx)
    }

    /// Advances and returns the `SEQ` for `sid`, wrapping per
    /// [`crate::gena::next_seq`].
    pub fn bump_seq(&mut self, sid: &str) -> Option<u32> {
        let idx = *self.by_sid.get(sid)?;
        let sub = self.slab.get_mut(idx)?;
        sub.seq = crate::gena::next_seq(sub.seq);
        Some(sub.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSubscription> {
        self.slab.iter().map(|(_, v)| v)
    }

    /// SIDs whose renewal deadline has passed as of `now`.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.iter()
            .filter(|s| s.expires_at <= now)
            .map(|s| s.sid.clone())
            .collect()
    }
}

/// Client-side subscription state. A control point only ever holds one
/// active subscription per service, so this needs no slab — just the
/// handful of fields a renewal timer and the NOTIFY dispatcher both read.
#[derive(Debug, Clone)]
pub struct ClientSubscription {
    pub sid: String,
    pub event_sub_url: Url,
    pub expires_at: Instant,
}

impl ClientSubscription {
    pub fn new(sid: String, event_sub_url: Url, timeout: Duration) -> Self {
        Self {
            sid,
            event_sub_url,
            expires_at: renewal_deadline(timeout),
        }
    }

    pub fn renew(&mut self, timeout: Duration) {
        self.expires_at = renewal_deadline(timeout);
    }
}

/// The native client renews at 75% of the granted timeout rather than
/// waiting until the last moment, to absorb network jitter and clock skew
/// between the renewal timer firing and the request landing.
fn renewal_deadline(timeout: Duration) -> Instant {
    if timeout.is_zero() {
        return Instant::now() + Duration::from_secs(365 * 24 * 3600);
    }
    let renew_after = timeout.mul_f64(0.75);
    Instant::now() + renew_after
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn insert_and_lookup_by_sid() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:abc".into(), vec![url("http://10.0.0.2:1234/cb")], Duration::from_secs(1800));
        assert!(table.get("uuid:abc").is_some());
        assert!(table.get("uuid:nope").is_none());
    }

    #[test]
    fn seq_advances_and_wraps() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:abc".into(), vec![url("http://x/")], Duration::from_secs(1800));
        assert_eq!(table.bump_seq("uuid:abc"), Some(1));
        assert_eq!(table.bump_seq("uuid:abc"), Some(2));
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:a".into(), vec![url("http://x/")], Duration::from_secs(60));
        table.remove("uuid:a");
        table.insert("uuid:b".into(), vec![url("http://y/")], Duration::from_secs(60));
        assert!(table.get("uuid:a").is_none());
        assert!(table.get("uuid:b").is_some());
        assert_eq!(table.iter().count(), 1);
    }

    #[test]
    fn renew_unknown_sid_errors() {
        let mut table = SubscriptionTable::new();
        assert!(table.renew("uuid:nope", Duration::from_secs(60)).is_err());
    }

    #[test]
    fn expired_lists_past_deadline_subscriptions() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:a".into(), vec![url("http://x/")], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(table.expired(Instant::now()), vec!["uuid:a".to_string()]);
    }

    #[test]
    fn zero_timeout_never_expires() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:a".into(), vec![url("http://x/")], Duration::ZERO);
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(table.expired(far_future).is_empty());
    }

    #[test]
    fn sweep_expired_removes_lapsed_subscriptions() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:a".into(), vec![url("http://x/")], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        let removed = table.sweep_expired(Instant::now());
        assert_eq!(removed, vec!["uuid:a".to_string()]);
        assert!(table.get("uuid:a").is_none());
    }

    #[test]
    fn renew_after_expiry_is_rejected() {
        let mut table = SubscriptionTable::new();
        table.insert("uuid:a".into(), vec![url("http://x/")], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(table.renew("uuid:a", Duration::from_secs(60)).is_err());
    }

    #[test]
    fn client_subscription_renews_at_75_percent() {
        let mut sub = ClientSubscription::new("uuid:x".into(), url("http://x/"), Duration::from_secs(100));
        let first_deadline = sub.expires_at;
        sub.renew(Duration::from_secs(200));
        assert!(sub.expires_at > first_deadline);
    }
}
