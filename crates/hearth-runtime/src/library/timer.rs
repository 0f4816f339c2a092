use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::trace;

use crate::engine::{set_function, throw_type_error};
use crate::error::{report_exception, ScriptError};
use crate::tasks::{delay_from_secs, TaskQueue};

/// Identifier handed to guest code. Starts at 1 and is never reused.
pub type TimerId = u64;

struct TimerEntry {
    recurring: bool,
    callback: v8::Global<v8::Function>,
}

struct TimerTable {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
}

/// `setTimeout`/`setInterval` on top of the delayed task queue.
///
/// The table is the source of truth: a queued firing whose id is no longer in
/// the table was cancelled and does nothing.
pub struct TimerService {
    table: RefCell<TimerTable>,
    tasks: Rc<TaskQueue>,
    timeout_default: Duration,
    interval_default: Duration,
}

impl TimerService {
    pub fn new(tasks: Rc<TaskQueue>, timeout_default_ms: u64, interval_default_ms: u64) -> Rc<Self> {
        Rc::new(Self {
            table: RefCell::new(TimerTable {
                next_id: 1,
                entries: HashMap::new(),
            }),
            tasks,
            timeout_default: Duration::from_millis(timeout_default_ms),
            interval_default: Duration::from_millis(interval_default_ms),
        })
    }

    /// Installs the four timer functions on `global`
    pub fn bind<'s>(scope: &mut v8::HandleScope<'s>, global: v8::Local<'s, v8::Object>) {
        set_function(scope, global, "setTimeout", set_timeout);
        set_function(scope, global, "setInterval", set_interval);
        set_function(scope, global, "clearTimeout", clear_timeout);
        set_function(scope, global, "clearInterval", clear_interval);
    }

    /// Registers a timer and queues its first firing
    pub fn schedule(
        self: &Rc<Self>,
        callback: v8::Global<v8::Function>,
        delay: Duration,
        recurring: bool,
        args: Rc<[v8::Global<v8::Value>]>,
    ) -> TimerId {
        let id = {
            let mut table = self.table.borrow_mut();
            let id = table.next_id;
            table.next_id += 1;
            table.entries.insert(
                id,
                TimerEntry {
                    recurring,
                    callback,
                },
            );
            id
        };
        trace!(target: "hearth", "Scheduled timer {} in {:?} (recurring: {})", id, delay, recurring);

        TimerTask {
            service: Rc::downgrade(self),
            id,
            delay,
            args,
        }
        .post(&self.tasks);
        id
    }

    /// Removes the timer; a firing already queued for it becomes a no-op
    pub fn cancel(&self, id: TimerId) -> bool {
        let removed = self.table.borrow_mut().entries.remove(&id);
        removed.is_some()
    }

    pub fn active_count(&self) -> usize {
        self.table.borrow().entries.len()
    }

    pub fn clear_all(&self) {
        let entries = std::mem::take(&mut self.table.borrow_mut().entries);
        drop(entries);
    }

    fn default_delay(&self, recurring: bool) -> Duration {
        if recurring {
            self.interval_default
        } else {
            self.timeout_default
        }
    }
}

fn set_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    schedule_from_guest(scope, &args, rv, "setTimeout", false);
}

fn set_interval(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    schedule_from_guest(scope, &args, rv, "setInterval", true);
}

fn clear_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    cancel_from_guest(scope, &args, "clearTimeout");
}

fn clear_interval(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    cancel_from_guest(scope, &args, "clearInterval");
}

fn schedule_from_guest(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
    name: &str,
    recurring: bool,
) {
    let Some(service) = scope.get_slot::<Rc<TimerService>>().cloned() else {
        return;
    };

    let delay = args.get(1);
    let valid_delay = args.length() < 2 || delay.is_number();
    let callback = v8::Local::<v8::Function>::try_from(args.get(0))
        .ok()
        .filter(|_| valid_delay);
    let Some(callback) = callback else {
        throw_type_error(scope, &format!("Invalid arguments. Usage: {name}(callback[, delay])."));
        return;
    };

    // Missing or negative delays fall back to the default
    let delay = match delay.number_value(scope) {
        Some(ms) if args.length() >= 2 && ms >= 0.0 => delay_from_secs(ms / 1000.0),
        _ => service.default_delay(recurring),
    };

    let extra: Rc<[v8::Global<v8::Value>]> = (2..args.length())
        .map(|i| v8::Global::new(scope, args.get(i)))
        .collect();
    let callback = v8::Global::new(scope, callback);
    let id = service.schedule(callback, delay, recurring, extra);
    rv.set_double(id as f64);
}

fn cancel_from_guest(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments, name: &str) {
    let Some(service) = scope.get_slot::<Rc<TimerService>>().cloned() else {
        return;
    };

    let id = args.get(0);
    if args.length() == 0 || !(id.is_number() || id.is_undefined()) {
        throw_type_error(scope, &format!("Invalid arguments. Usage: {name}(timerId)."));
        return;
    }
    if let Some(id) = id.integer_value(scope).filter(|_| id.is_number()) {
        if id >= 0 {
            service.cancel(id as TimerId);
        }
    }
}

/// One queued firing. Owns the captured arguments until it hands them to the next firing.
struct TimerTask {
    service: Weak<TimerService>,
    id: TimerId,
    delay: Duration,
    args: Rc<[v8::Global<v8::Value>]>,
}

impl TimerTask {
    fn post(self, tasks: &TaskQueue) {
        let delay = self.delay;
        tasks.post_delayed(Box::new(move |scope: &mut v8::HandleScope| self.run(scope)), delay);
    }

    fn run(self, scope: &mut v8::HandleScope) {
        let Some(service) = self.service.upgrade() else {
            return;
        };

        let (callback, recurring) = {
            let mut table = service.table.borrow_mut();
            let Some(entry) = table.entries.get(&self.id) else {
                // Cleared while this firing was queued
                return;
            };
            let found = (entry.callback.clone(), entry.recurring);
            if !found.1 {
                table.entries.remove(&self.id);
            }
            found
        };

        let args = if recurring {
            let args = Rc::clone(&self.args);
            TimerTask {
                service: Rc::downgrade(&service),
                id: self.id,
                delay: self.delay,
                args: self.args,
            }
            .post(&service.tasks);
            args
        } else {
            self.args
        };

        let callback = v8::Local::new(scope, &callback);
        let args: Vec<v8::Local<v8::Value>> = args.iter().map(|arg| v8::Local::new(scope, arg)).collect();
        let receiver = scope.get_current_context().global(scope);

        let tc = &mut v8::TryCatch::new(scope);
        if callback.call(tc, receiver.into(), &args).is_none() {
            report_exception(&ScriptError::from_try_catch(tc));
        }
    }
}
