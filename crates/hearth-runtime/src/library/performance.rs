use std::time::Instant;

use crate::engine::{set_function, set_property};

/// Time origin of `performance.now()`, one per engine
pub(crate) struct PerformanceClock {
    origin: Instant,
}

impl PerformanceClock {
    pub(crate) fn new(origin: Instant) -> Self {
        Self { origin }
    }
}

/// Installs `performance.now()`, milliseconds since the engine started
pub fn bind<'s>(scope: &mut v8::HandleScope<'s>, global: v8::Local<'s, v8::Object>) {
    let performance = v8::Object::new(scope);
    set_function(scope, performance, "now", now);
    set_property(scope, global, "performance", performance.into());
}

fn now(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    if let Some(clock) = scope.get_slot::<PerformanceClock>() {
        rv.set_double(clock.origin.elapsed().as_secs_f64() * 1000.0);
    }
}
