#![forbid(unsafe_code)]

//! Subscriber that records every delivery it receives.
//!
//! A [`Recorder`] subscribes to one container on creation and keeps the
//! values it hears about, in order, until it is detached. Scenario tests
//! assert on [`Recorder::values`] and dump [`Recorder::to_jsonl`] as
//! evidence when an assertion fails.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::json;
use statebind::StateRead;
use statebind_core::{StateResult, Subscriber, subscriber};

/// Ordered log of the values delivered to one subscriber.
pub struct Recorder<T: 'static> {
    label: &'static str,
    state: Rc<dyn StateRead<T>>,
    subscriber: Subscriber<T>,
    log: Rc<RefCell<Vec<StateResult<T>>>>,
    attached: RefCell<bool>,
}

impl<T: Clone + 'static> Recorder<T> {
    /// Subscribe to `state`, with immediate delivery if `run_immediately`.
    pub fn attach(
        label: &'static str,
        state: Rc<dyn StateRead<T>>,
        run_immediately: bool,
    ) -> Self {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let subscriber = state.subscribe(
            subscriber(move |value: &StateResult<T>| sink.borrow_mut().push(value.clone())),
            run_immediately,
        );
        Self {
            label,
            state,
            subscriber,
            log,
            attached: RefCell::new(true),
        }
    }

    /// Everything delivered so far.
    #[must_use]
    pub fn values(&self) -> Vec<StateResult<T>> {
        self.log.borrow().clone()
    }

    /// Only the `Ok` deliveries.
    #[must_use]
    pub fn oks(&self) -> Vec<T> {
        self.log
            .borrow()
            .iter()
            .filter_map(|value| value.as_ref().ok().cloned())
            .collect()
    }

    /// Last delivery, if any.
    #[must_use]
    pub fn last(&self) -> Option<StateResult<T>> {
        self.log.borrow().last().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.borrow().is_empty()
    }

    /// Forget recorded deliveries; stays subscribed.
    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }

    /// Unsubscribe. Recorded values stay readable.
    pub fn detach(&self) {
        if self.attached.replace(false) {
            self.state.unsubscribe(&self.subscriber);
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        *self.attached.borrow()
    }
}

impl<T: fmt::Debug + 'static> Recorder<T> {
    /// One JSON object per delivery, newline separated.
    #[must_use]
    pub fn to_jsonl(&self) -> String {
        self.log
            .borrow()
            .iter()
            .enumerate()
            .map(|(seq, value)| {
                let entry = match value {
                    Ok(v) => json!({
                        "event": "delivery",
                        "recorder": self.label,
                        "seq": seq,
                        "ok": true,
                        "value": format!("{v:?}"),
                    }),
                    Err(err) => json!({
                        "event": "delivery",
                        "recorder": self.label,
                        "seq": seq,
                        "ok": false,
                        "code": err.code(),
                        "reason": err.reason(),
                    }),
                };
                entry.to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<T: 'static> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("label", &self.label)
            .field("deliveries", &self.log.borrow().len())
            .field("attached", &*self.attached.borrow())
            .finish()
    }
}

impl<T: 'static> Drop for Recorder<T> {
    fn drop(&mut self) {
        if *self.attached.borrow() {
            self.state.unsubscribe(&self.subscriber);
        }
    }
}
