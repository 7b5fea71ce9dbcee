//! `LastChange` aggregator (spec.md §3, §4.6): coalesces a burst of state
//! variable mutations into a single GENA notification. A later write to a
//! variable already pending replaces its value rather than queuing a
//! second entry; a failed emission leaves the pending set intact so the
//! next mutation retries the same batch instead of dropping it.
//!
//! Grounded in the native `LastChangeVariable`, which batches changes
//! behind a timer rather than emitting one event per `SetStateVariable`
//! call.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A pending or emitted batch entry: `(instance_id, variable_name, value)`.
type Change = (u32, String, String);
type EmitFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type EmitFn = Arc<dyn Fn(Vec<Change>) -> EmitFuture + Send + Sync>;

struct Inner {
    pending: Mutex<HashMap<(u32, String), String>>,
    last_emit: Mutex<Option<Instant>>,
    scheduled: Mutex<bool>,
    min_interval: Duration,
    emit: EmitFn,
}

/// A handle to one instance's `LastChange` aggregator. Cheap to clone; the
/// state lives behind the shared `Inner`.
#[derive(Clone)]
pub struct LastChange {
    inner: Arc<Inner>,
}

impl LastChange {
    /// `min_interval` is the minimum gap between two emissions; `emit` is
    /// invoked with the coalesced `(variable, value)` batch and returns
    /// whether delivery succeeded.
    pub fn new<F, Fut>(min_interval: Duration, emit: F) -> Self
    where
        F: Fn(Vec<Change>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                last_emit: Mutex::new(None),
                scheduled: Mutex::new(false),
                min_interval,
                emit: Arc::new(move |batch| Box::pin(emit(batch))),
            }),
        }
    }

    /// Records a variable mutation scoped to `instance_id`. Replaces any
    /// value already pending for `(instance_id, name)`. Triggers an
    /// immediate emission if the minimum interval has already elapsed since
    /// the last one, otherwise schedules a delayed emission if one isn't
    /// already in flight.
    pub fn record(&self, instance_id: u32, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .pending
            .lock()
            .expect("last_change pending mutex poisoned")
            .insert((instance_id, name.into()), value.into());

        let due_now = {
            let last_emit = self.inner.last_emit.lock().expect("last_change last_emit mutex poisoned");
            match *last_emit {
                None => true,
                Some(t) => t.elapsed() >= self.inner.min_interval,
            }
        };

        if due_now {
            self.emit_now();
        } else {
            self.schedule_delayed();
        }
    }

    fn emit_now(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let batch: Vec<Change> = {
                let pending = inner.pending.lock().expect("last_change pending mutex poisoned");
                pending.iter().map(|((iid, k), v)| (*iid, k.clone(), v.clone())).collect()
            };
            if batch.is_empty() {
                return;
            }
            let succeeded = (inner.emit)(batch.clone()).await;
            *inner.last_emit.lock().expect("last_change last_emit mutex poisoned") = Some(Instant::now());
            if succeeded {
                let mut pending = inner.pending.lock().expect("last_change pending mutex poisoned");
                for (iid, k, _) in &batch {
                    pending.remove(&(*iid, k.clone()));
                }
            }
            // On failure the pending set is left untouched so the next
            // mutation retries the same batch.
        });
    }

    fn schedule_delayed(&self) {
        let mut scheduled = self.inner.scheduled.lock().expect("last_change scheduled mutex poisoned");
        if *scheduled {
            return;
        }
        *scheduled = true;
        drop(scheduled);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let wait = {
                let last_emit = inner.last_emit.lock().expect("last_change last_emit mutex poisoned");
                match *last_emit {
                    Some(t) => inner.min_interval.saturating_sub(t.elapsed()),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;

            *inner.scheduled.lock().expect("last_change scheduled mutex poisoned") = false;

            let batch: Vec<Change> = {
                let pending = inner.pending.lock().expect("last_change pending mutex poisoned");
                pending.iter().map(|((iid, k), v)| (*iid, k.clone(), v.clone())).collect()
            };
            if batch.is_empty() {
                return;
            }
            let succeeded = (inner.emit)(batch.clone()).await;
            *inner.last_emit.lock().expect("last_change last_emit mutex poisoned") = Some(Instant::now());
            if succeeded {
                let mut pending = inner.pending.lock().expect("last_change pending mutex poisoned");
                for (iid, k, _) in &batch {
                    pending.remove(&(*iid, k.clone()));
                }
            }
        });
    }
}

/// Builds the `LastChange` state variable's own XML payload: one `Event`
/// root in `event_ns`, one `InstanceID` element per distinct instance that
/// changed, one self-closing element per changed variable carrying its new
/// value as a `val` attribute. This is the value that itself gets wrapped in
/// a GENA `e:property` by [`crate::gena::build_property_set`].
pub fn build_last_change_xml(event_ns: &str, vars: &[(u32, String, String)]) -> String {
    let mut instances: Vec<u32> = vars.iter().map(|(instance_id, _, _)| *instance_id).collect();
    instances.sort_unstable();
    instances.dedup();

    let mut body = String::new();
    for instance_id in instances {
        let mut instance_body = String::new();
        for (iid, name, value) in vars {
            if *iid != instance_id {
                continue;
            }
            instance_body.push_str(&format!("<{name} val=\"{}\"/>", crate::xml::xml_escape(value)));
        }
        body.push_str(&format!("<InstanceID val=\"{instance_id}\">{instance_body}</InstanceID>"));
    }
    format!("<Event xmlns=\"{event_ns}\">{body}</Event>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn first_change_emits_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let lc = LastChange::new(Duration::from_millis(50), move |_batch| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        lc.record(0, "TransportState", "PLAYING");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rapid_changes_coalesce_into_one_emission() {
        let batches: Arc<Mutex<Vec<Vec<Change>>>> = Arc::new(Mutex::new(Vec::new()));
        let b = batches.clone();
        let lc = LastChange::new(Duration::from_millis(100), move |batch| {
            let b = b.clone();
            async move {
                b.lock().unwrap().push(batch);
                true
            }
        });

        lc.record(0, "TransportState", "PLAYING");
        tokio::time::sleep(Duration::from_millis(5)).await;
        lc.record(0, "TransportState", "PAUSED_PLAYBACK");
        lc.record(0, "CurrentTrack", "2");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let collected = batches.lock().unwrap();
        assert_eq!(collected.len(), 2);
        let last = collected.last().unwrap();
        let state: Vec<_> = last.iter().filter(|(_, k, _)| k == "TransportState").collect();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].2, "PAUSED_PLAYBACK");
    }

    #[tokio::test]
    async fn failed_emission_retains_pending_for_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let lc = LastChange::new(Duration::from_millis(10), move |_batch| {
            let a = a.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                n > 0
            }
        });

        lc.record(0, "Mute", "1");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        lc.record(0, "Volume", "10");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn builds_last_change_xml_with_instance_wrapper() {
        let xml = build_last_change_xml(
            "urn:schemas-upnp-org:metadata-1-0/AVT/",
            &[(0, "TransportState".into(), "PLAYING".into())],
        );
        assert!(xml.contains("<InstanceID val=\"0\">"));
        assert!(xml.contains("<TransportState val=\"PLAYING\"/>"));
    }

    #[test]
    fn builds_last_change_xml_with_multiple_instances() {
        let xml = build_last_change_xml(
            "urn:schemas-upnp-org:metadata-1-0/AVT/",
            &[(0, "TransportState".into(), "STOPPED".into()), (1, "TransportState".into(), "PLAYING".into())],
        );
        assert!(xml.contains("<InstanceID val=\"0\"><TransportState val=\"STOPPED\"/></InstanceID>"));
        assert!(xml.contains("<InstanceID val=\"1\"><TransportState val=\"PLAYING\"/></InstanceID>"));
    }
}
