use serde_json::Value;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use crate::callbacks::{CallbackRegistry, Callbacks, Slot};
use crate::error::CallbackResult;

/// A classified unit of data received from the inference service.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceEvent {
    /// Information about the running model, e.g. its inputs and outputs.
    Info(Value),
    /// An inference result.
    Data(Value),
    /// A failure reported by the service or by the transport.
    Error(String),
}

/// Delivers inference events to the callbacks a host registered.
///
/// A handler that returns an error or panics is disabled after its first failure;
/// the failure never reaches the backend that called [`DispatchBridge::dispatch`].
pub struct DispatchBridge {
    registry: CallbackRegistry,
}

impl DispatchBridge {
    /// Sets up the bridge, recording which callbacks the host registered.
    pub fn new(callbacks: Callbacks) -> Self {
        Self {
            registry: CallbackRegistry::discover(callbacks),
        }
    }

    /// Which callbacks are registered, active or disabled.
    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Delivers one event, returning once the handler completed or was skipped.
    pub fn dispatch(&self, event: InferenceEvent) {
        match event {
            InferenceEvent::Info(info) => deliver(&self.registry.info, |handler| handler(&info)),
            InferenceEvent::Data(data) => deliver(&self.registry.data, |handler| handler(&data)),
            InferenceEvent::Error(message) => {
                deliver(&self.registry.error, |handler| handler(&message))
            }
        }
    }
}

impl std::fmt::Debug for DispatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBridge")
            .field("registry", &self.registry)
            .finish()
    }
}

fn deliver<H: ?Sized>(slot: &Slot<H>, call: impl FnOnce(&H) -> CallbackResult) {
    let Some(handler) = slot.active_handler() else {
        return;
    };

    let reason = match panic::catch_unwind(AssertUnwindSafe(|| call(handler))) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    // concurrent failures race here, only the one that flips the slot reports
    if slot.disable() {
        log::error!("{} callback failed, disabling it: {reason}", slot.kind());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
