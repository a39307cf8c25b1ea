use serde_json::Value;
use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use crate::error::CallbackResult;

/// Host handler for structured (info and data) events.
pub type JsonHandler = dyn Fn(&Value) -> CallbackResult + Send + Sync;

/// Host handler for error messages.
pub type TextHandler = dyn Fn(&str) -> CallbackResult + Send + Sync;

/// The three callback capabilities a host application may provide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Model information, sent once the service is reachable.
    Info,
    /// Inference results.
    Data,
    /// Service or transport failures.
    Error,
}

impl SlotKind {
    /// Name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Info => "info",
            SlotKind::Data => "data",
            SlotKind::Error => "error",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a single callback slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// The host never registered a handler for this slot.
    NotRegistered,
    /// Events are delivered to the registered handler.
    Active,
    /// The handler failed once and no longer receives events.
    Disabled,
}

/// The set of handlers a host application registers with a client.
///
/// Every handler is optional; a host interested only in results can register
/// just [`Callbacks::on_data`].
///
/// ```
/// use infernum_client::Callbacks;
///
/// let callbacks = Callbacks::new().on_data(|data| {
///     println!("received {data}");
///     Ok(())
/// });
/// ```
#[derive(Default)]
pub struct Callbacks {
    info: Option<Box<JsonHandler>>,
    data: Option<Box<JsonHandler>>,
    error: Option<Box<TextHandler>>,
}

impl Callbacks {
    /// An empty set; every slot starts unregistered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for service information events.
    pub fn on_info<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    {
        self.info = Some(Box::new(handler));
        self
    }

    /// Registers the handler for inference results.
    pub fn on_data<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    {
        self.data = Some(Box::new(handler));
        self
    }

    /// Registers the handler for error messages.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> CallbackResult + Send + Sync + 'static,
    {
        self.error = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("info", &self.info.is_some())
            .field("data", &self.data.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

pub(crate) struct Slot<H: ?Sized> {
    kind: SlotKind,
    state: Mutex<SlotState>,
    handler: Option<Box<H>>,
}

impl<H: ?Sized> Slot<H> {
    fn discover(kind: SlotKind, handler: Option<Box<H>>) -> Self {
        let state = if handler.is_some() {
            SlotState::Active
        } else {
            log::info!("no {kind} callback registered, {kind} events will be ignored");
            SlotState::NotRegistered
        };
        Self {
            kind,
            state: Mutex::new(state),
            handler,
        }
    }

    pub(crate) fn kind(&self) -> SlotKind {
        self.kind
    }

    pub(crate) fn state(&self) -> SlotState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the handler while the slot is active.
    pub(crate) fn active_handler(&self) -> Option<&H> {
        match self.state() {
            SlotState::Active => self.handler.as_deref(),
            SlotState::NotRegistered | SlotState::Disabled => None,
        }
    }

    /// Moves an active slot to `Disabled`.
    ///
    /// Returns `true` only for the caller that performed the transition.
    pub(crate) fn disable(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SlotState::Active {
            *state = SlotState::Disabled;
            true
        } else {
            false
        }
    }
}

/// Records which callback slots the host provided.
///
/// Built exactly once when the dispatch bridge is set up and never re-probed.
pub struct CallbackRegistry {
    pub(crate) info: Slot<JsonHandler>,
    pub(crate) data: Slot<JsonHandler>,
    pub(crate) error: Slot<TextHandler>,
}

impl CallbackRegistry {
    /// Records each slot as active or absent, logging a diagnostic per absent slot.
    pub fn discover(callbacks: Callbacks) -> Self {
        Self {
            info: Slot::discover(SlotKind::Info, callbacks.info),
            data: Slot::discover(SlotKind::Data, callbacks.data),
            error: Slot::discover(SlotKind::Error, callbacks.error),
        }
    }

    /// Current state of the slot for `kind`.
    pub fn state(&self, kind: SlotKind) -> SlotState {
        match kind {
            SlotKind::Info => self.info.state(),
            SlotKind::Data => self.data.state(),
            SlotKind::Error => self.error.state(),
        }
    }

    /// Whether events of `kind` are currently delivered to the host.
    pub fn is_present(&self, kind: SlotKind) -> bool {
        self.state(kind) == SlotState::Active
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("info", &self.info.state())
            .field("data", &self.data.state())
            .field("error", &self.error.state())
            .finish()
    }
}
