//! Synchronous, ordered event publication
//!
//! Listeners are invoked in subscription order. A failing listener is isolated
//! from the runner and from the other listeners.

use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::{error, warn};

use crate::models::{Event, EventKind, TestError};

/// Consumer of lifecycle events (reporter, stats collector, exit-code decider)
pub trait Listener: Send {
    /// Name used in [`ListenerError`] diagnostics
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }

    fn on_event(&mut self, event: &Event) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
    F: FnMut(&Event) -> anyhow::Result<()> + Send,
{
    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// A listener failed while handling an event
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("listener `{listener}` failed on `{event}` event: {message}")]
pub struct ListenerError {
    pub listener: String,
    pub event: EventKind,
    pub message: String,
}

/// Ordered fan-out of events to listeners
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Box<dyn Listener>>,
    errors: Vec<ListenerError>,
    ended: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl Listener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn subscribe_boxed(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to every listener
    ///
    /// Nothing is delivered after `End`.
    pub fn emit(&mut self, event: Event) {
        if self.ended {
            warn!(event = %event.kind(), "event emitted after end was dropped");
            return;
        }

        let kind = event.kind();
        for listener in &mut self.listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            let message = match delivered {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("panicked: {}", TestError::from_panic(payload).message),
            };
            let failure = ListenerError {
                listener: listener.name(),
                event: kind,
                message,
            };
            error!("{failure}");
            self.errors.push(failure);
        }

        if kind == EventKind::End {
            self.ended = true;
        }
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn errors(&self) -> &[ListenerError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<ListenerError> {
        std::mem::take(&mut self.errors)
    }
}
