use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{error, warn};

use crate::engine::{display, string};

/// Private symbol carrying a tracked promise's id
const PROMISE_ID: &str = "promiseId";

struct RejectedPromise {
    promise: v8::Global<v8::Promise>,
    reason: v8::Global<v8::Value>,
}

struct TrackerState {
    next_id: u64,
    records: BTreeMap<u64, RejectedPromise>,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: BTreeMap::new(),
        }
    }
}

/// Tracks promises rejected without a handler and reports the ones that stay unhandled
#[derive(Default)]
pub struct RejectionTracker {
    state: RefCell<TrackerState>,
    reported: Cell<usize>,
}

impl RejectionTracker {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Hooks the tracker into the isolate's promise rejection events
    pub fn install(self: &Rc<Self>, isolate: &mut v8::Isolate) {
        isolate.set_slot(Rc::clone(self));
        isolate.set_promise_reject_callback(promise_reject_callback);
    }

    /// Unhooks the tracker and forgets every record
    pub fn uninstall(&self, isolate: &mut v8::Isolate) {
        isolate.remove_slot::<Rc<RejectionTracker>>();
        let records = std::mem::take(&mut *self.state.borrow_mut());
        drop(records);
    }

    /// Number of rejections awaiting the next check
    pub fn pending(&self) -> usize {
        self.state.borrow().records.len()
    }

    /// Unhandled rejections reported since the tracker was created
    pub fn reported(&self) -> usize {
        self.reported.get()
    }

    /// Reports every tracked promise that is still rejected, then forgets all records.
    /// Returns the number of reports.
    pub fn check_unhandled_rejections(&self, scope: &mut v8::HandleScope) -> usize {
        let records = std::mem::take(&mut self.state.borrow_mut().records);

        let mut reported = 0;
        for record in records.into_values() {
            let promise = v8::Local::new(scope, &record.promise);
            if promise.state() != v8::PromiseState::Rejected {
                continue;
            }
            let reason = v8::Local::new(scope, &record.reason);
            let location = v8::Exception::create_message(scope, reason);
            let script = location
                .get_script_resource_name(scope)
                .map(|name| display(scope, name))
                .filter(|name| !name.is_empty() && name != "undefined")
                .unwrap_or_else(|| "<unknown>".to_string());
            let line = location.get_line_number(scope).unwrap_or(0);
            let reason = display(scope, reason);
            error!(
                target: "hearth",
                "Unhandled Promise rejection in {} at line {}, column {}: {}",
                script,
                line,
                location.get_start_column(),
                reason
            );
            reported += 1;
        }
        self.reported.set(self.reported.get() + reported);
        reported
    }

    fn track(&self, scope: &mut v8::HandleScope, promise: v8::Local<v8::Promise>, reason: v8::Local<v8::Value>) {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        let key = promise_id_key(scope);
        let value = v8::Number::new(scope, id as f64);
        promise.set_private(scope, key, value.into());

        let record = RejectedPromise {
            promise: v8::Global::new(scope, promise),
            reason: v8::Global::new(scope, reason),
        };
        self.state.borrow_mut().records.insert(id, record);
    }

    fn untrack(&self, scope: &mut v8::HandleScope, promise: v8::Local<v8::Promise>) {
        let key = promise_id_key(scope);
        let id = promise
            .get_private(scope, key)
            .filter(|id| id.is_number())
            .and_then(|id| id.integer_value(scope));
        let Some(id) = id else {
            warn!(target: "hearth", "Handler added after reject, but the promise has no id");
            return;
        };
        let removed = self.state.borrow_mut().records.remove(&(id as u64));
        drop(removed);
    }
}

fn promise_id_key<'s>(scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Private> {
    let name = string(scope, PROMISE_ID);
    v8::Private::for_api(scope, Some(name))
}

extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
    let scope = &mut unsafe { v8::CallbackScope::new(&message) };
    let scope = &mut v8::HandleScope::new(scope);
    let Some(tracker) = scope.get_slot::<Rc<RejectionTracker>>().cloned() else {
        return;
    };

    let promise = message.get_promise();
    match message.get_event() {
        v8::PromiseRejectEvent::PromiseRejectWithNoHandler => {
            let reason = message
                .get_value()
                .unwrap_or_else(|| v8::undefined(scope).into());
            tracker.track(scope, promise, reason);
        }
        v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject => tracker.untrack(scope, promise),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::run_source;
    use crate::engine::test_support::with_scope;

    fn tracked(scope: &mut v8::HandleScope) -> Rc<RejectionTracker> {
        let tracker = RejectionTracker::new();
        tracker.install(scope);
        tracker
    }

    #[test]
    fn test_unhandled_rejection_reported_once() {
        with_scope(|scope| {
            let tracker = tracked(scope);
            run_source(scope, "lost.js", "globalThis.p = Promise.reject(new Error('lost'))").unwrap();

            assert_eq!(tracker.pending(), 1);
            assert_eq!(tracker.check_unhandled_rejections(scope), 1);
            assert_eq!(tracker.check_unhandled_rejections(scope), 0);
            assert_eq!(tracker.reported(), 1);
        });
    }

    #[test]
    fn test_late_handler_clears_record() {
        with_scope(|scope| {
            let tracker = tracked(scope);
            run_source(scope, "late.js", "globalThis.p = Promise.reject('late')").unwrap();
            assert_eq!(tracker.pending(), 1);

            run_source(scope, "late.js", "p.catch(() => {})").unwrap();
            assert_eq!(tracker.pending(), 0);
            assert_eq!(tracker.check_unhandled_rejections(scope), 0);
        });
    }

    #[test]
    fn test_ids_are_not_reused() {
        with_scope(|scope| {
            let tracker = tracked(scope);
            let first = run_source(scope, "ids.js", "Promise.reject(null)").unwrap();
            let second = run_source(scope, "ids.js", "Promise.reject(null)").unwrap();

            let key = promise_id_key(scope);
            let mut id = |value: v8::Local<v8::Value>| {
                let promise = v8::Local::<v8::Object>::try_from(value).unwrap();
                promise.get_private(scope, key).and_then(|id| id.integer_value(scope))
            };
            assert_eq!(id(first), Some(1));
            assert_eq!(id(second), Some(2));
            assert_eq!(tracker.pending(), 2);
        });
    }

    #[test]
    fn test_uninstall_stops_tracking() {
        with_scope(|scope| {
            let tracker = tracked(scope);
            run_source(scope, "before.js", "Promise.reject('before')").unwrap();
            tracker.uninstall(scope);
            assert_eq!(tracker.pending(), 0);

            run_source(scope, "after.js", "Promise.reject('after')").unwrap();
            assert_eq!(tracker.pending(), 0);
        });
    }
}
