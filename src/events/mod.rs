use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::thread;

use serde_json::Value;

pub const WORKER_CONNECTED_EVENT: &str = "worker.connected";
pub const WORKER_REGISTERED_EVENT: &str = "worker.registered";
pub const WORKER_REMOVED_EVENT: &str = "worker.removed";
pub const TASK_DEAD_LETTERED_EVENT: &str = "task.dead-lettered";

pub type ListenerResult = Result<(), String>;

type SyncHandler = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type DetachedHandler = Arc<dyn Fn(Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(
                f,
                "listener #{listener_index} panicked for event '{event}'"
            ),
        }
    }
}

impl Error for EmitError {}

#[derive(Clone)]
enum Listener {
    // Runs on the emitting thread; a failure surfaces to the emitter.
    Sync(SyncHandler),
    // Runs on its own thread; failures are isolated from the emitter.
    Detached(DetachedHandler),
}

// One listener list per event name, walked in registration order on emit.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.push(event_name.into(), Listener::Sync(Arc::new(listener)));
    }

    pub fn on_async<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.push(event_name.into(), Listener::Detached(Arc::new(listener)));
    }

    fn push(&self, event_name: String, listener: Listener) {
        self.listeners
            .write()
            .expect("listener map lock poisoned")
            .entry(event_name)
            .or_default()
            .push(listener);
    }

    // Walks the event's listeners in registration order. Sync listeners run
    // inline and the first failure or panic aborts the walk; detached
    // listeners already reached keep running on their own threads.
    pub fn emit(
        &self,
        event_name: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), EmitError> {
        let event = Event::new(event_name, payload);

        let handlers = {
            let listeners = self.listeners.read().expect("listener map lock poisoned");
            match listeners.get(&event.name) {
                Some(handlers) => handlers.clone(),
                None => return Ok(()),
            }
        };

        for (idx, listener) in handlers.into_iter().enumerate() {
            match listener {
                Listener::Sync(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(message)) => {
                            return Err(EmitError::ListenerFailed {
                                event: event.name.clone(),
                                listener_index: idx,
                                message,
                            });
                        }
                        Err(_) => {
                            return Err(EmitError::ListenerPanicked {
                                event: event.name.clone(),
                                listener_index: idx,
                            });
                        }
                    }
                }
                Listener::Detached(handler) => {
                    let event_for_listener = event.clone();
                    thread::spawn(move || {
                        let name = event_for_listener.name.clone();
                        match catch_unwind(AssertUnwindSafe(|| handler(event_for_listener))) {
                            Ok(Ok(())) => {}
                            Ok(Err(message)) => {
                                eprintln!(
                                    "detached listener #{idx} failed for event '{name}': {message}"
                                );
                            }
                            Err(_) => {
                                eprintln!(
                                    "detached listener #{idx} panicked for event '{name}'"
                                );
                            }
                        }
                    });
                }
            }
        }

        Ok(())
    }
}
