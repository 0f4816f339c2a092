use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::engine::{get_property, key_from_value, key_to_value};
use crate::error::{report_exception, ScriptError};
use crate::lifetime::{LifetimeRegistry, SlotKey};

/// Reason a host operation rejects with when its abort context fires.
/// Rejections carrying exactly this string surface to guest code as the `SIGABORT` symbol.
pub const ABORT_ERROR: &str = "AbortError";

/// A cooperative cancellation source host work can listen to
pub trait CancelToken {
    fn is_cancelled(&self, scope: &mut v8::HandleScope) -> bool;

    /// Registers `callback` to be called when the token is cancelled
    fn on_cancel(&self, scope: &mut v8::HandleScope, callback: v8::Local<v8::Function>) -> Result<(), ScriptError>;

    /// Removes a callback registered with [`CancelToken::on_cancel`]
    fn off_cancel(&self, scope: &mut v8::HandleScope, callback: v8::Local<v8::Function>) -> Result<(), ScriptError>;
}

/// A guest task context object: `isAborted`, `addOnAbort(fn)` and `removeOnAbort(fn)`
pub struct GuestAbortContext {
    object: v8::Global<v8::Object>,
}

impl GuestAbortContext {
    pub fn new(object: v8::Global<v8::Object>) -> Self {
        Self { object }
    }

    pub fn object(&self) -> &v8::Global<v8::Object> {
        &self.object
    }

    fn call_method(
        &self,
        scope: &mut v8::HandleScope,
        name: &str,
        callback: v8::Local<v8::Function>,
    ) -> Result<(), ScriptError> {
        let object = v8::Local::new(scope, &self.object);
        let method = get_property(scope, object, name).and_then(|m| v8::Local::<v8::Function>::try_from(m).ok());
        let Some(method) = method else {
            warn!(target: "hearth", "Abort context has no callable '{}'", name);
            return Err(ScriptError::new(format!("abort context.{name} is not a function")));
        };

        let tc = &mut v8::TryCatch::new(scope);
        match method.call(tc, object.into(), &[callback.into()]) {
            Some(_) => Ok(()),
            None => Err(ScriptError::from_try_catch(tc)),
        }
    }
}

impl CancelToken for GuestAbortContext {
    fn is_cancelled(&self, scope: &mut v8::HandleScope) -> bool {
        let object = v8::Local::new(scope, &self.object);
        get_property(scope, object, "isAborted").is_some_and(|flag| flag.boolean_value(scope))
    }

    fn on_cancel(&self, scope: &mut v8::HandleScope, callback: v8::Local<v8::Function>) -> Result<(), ScriptError> {
        self.call_method(scope, "addOnAbort", callback)
    }

    fn off_cancel(&self, scope: &mut v8::HandleScope, callback: v8::Local<v8::Function>) -> Result<(), ScriptError> {
        self.call_method(scope, "removeOnAbort", callback)
    }
}

type AbortHandler = Rc<dyn Fn(&mut v8::HandleScope)>;

/// Host abort callbacks, found by the key their guest function carries
pub(crate) type AbortHandlers = Rc<RefCell<LifetimeRegistry<AbortHandler>>>;

/// Connects a cancellation token to a host abort callback.
///
/// The same guest-visible function is used to subscribe and unsubscribe, so the
/// token can match the two calls by identity.
pub struct CancellationBridge {
    token: Option<Box<dyn CancelToken>>,
    callback: v8::Global<v8::Function>,
    on_abort: AbortHandler,
    handlers: Weak<RefCell<LifetimeRegistry<AbortHandler>>>,
    key: SlotKey,
    subscribed: Cell<bool>,
}

impl CancellationBridge {
    /// Returns `None` outside a runtime-managed isolate
    pub fn new(
        scope: &mut v8::HandleScope,
        token: Option<Box<dyn CancelToken>>,
        on_abort: impl Fn(&mut v8::HandleScope) + 'static,
    ) -> Option<Self> {
        let handlers = scope.get_slot::<AbortHandlers>().cloned()?;
        let on_abort: AbortHandler = Rc::new(on_abort);
        let key = handlers.borrow_mut().insert(Rc::clone(&on_abort));

        let data = key_to_value(scope, key.to_bits());
        let Some(callback) = v8::Function::builder(abort_callback).data(data).build(scope) else {
            handlers.borrow_mut().remove(key);
            return None;
        };

        Some(Self {
            token,
            callback: v8::Global::new(scope, callback),
            on_abort,
            handlers: Rc::downgrade(&handlers),
            key,
            subscribed: Cell::new(false),
        })
    }

    /// Starts listening. A token that is already cancelled fires the abort
    /// callback right away and is never registered with.
    pub fn subscribe(&self, scope: &mut v8::HandleScope) {
        let Some(token) = &self.token else {
            return;
        };
        if self.subscribed.get() {
            return;
        }

        if token.is_cancelled(scope) {
            debug!(target: "hearth", "Abort context already aborted, aborting immediately");
            (self.on_abort)(scope);
            return;
        }

        let callback = v8::Local::new(scope, &self.callback);
        match token.on_cancel(scope, callback) {
            Ok(()) => self.subscribed.set(true),
            Err(e) => report_exception(&e),
        }
    }

    /// Stops listening. Safe to call any number of times.
    pub fn unsubscribe(&self, scope: &mut v8::HandleScope) {
        if !self.subscribed.replace(false) {
            return;
        }
        if let Some(token) = &self.token {
            debug!(target: "hearth", "Unsubscribing from abort context");
            let callback = v8::Local::new(scope, &self.callback);
            if let Err(e) = token.off_cancel(scope, callback) {
                report_exception(&e);
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.get()
    }
}

impl Drop for CancellationBridge {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            let removed = handlers.borrow_mut().remove(self.key);
            drop(removed);
        }
    }
}

fn abort_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let Some(handlers) = scope.get_slot::<AbortHandlers>().cloned() else {
        return;
    };
    let Some(key) = key_from_value(args.data()).map(SlotKey::from_bits) else {
        return;
    };
    // A bridge that is already gone no longer reacts
    let handler = handlers.borrow().get(key).cloned();
    if let Some(handler) = handler {
        handler(scope);
    }
}
