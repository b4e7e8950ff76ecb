//! Subscription registry: which callbacks listen on which topic.
//!
//! The registry outlives individual links. After every (re)connect the client
//! re-subscribes each registered topic and starts a fresh dispatcher on the
//! new link's event stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::senml::{PropertyEvent, PropertyValue};

pub type Callback = Arc<dyn Fn(PropertyValue) + Send + Sync>;

struct Listener {
    /// `None` receives every event on the topic.
    property: Option<String>,
    callback: Callback,
    active: AtomicBool,
}

impl Listener {
    fn wants(&self, event: &PropertyEvent) -> bool {
        match &self.property {
            Some(name) => event.property_name.as_deref() == Some(name.as_str()),
            None => true,
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    topics: Mutex<BTreeMap<String, Vec<Arc<Listener>>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Arc<Listener>>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a listener. Returns true if `topic` was not registered before.
    pub(crate) fn register(&self, topic: &str, property: Option<String>, callback: Callback) -> bool {
        let mut topics = self.lock();
        let listener = Arc::new(Listener {
            property,
            callback,
            active: AtomicBool::new(true),
        });
        match topics.get_mut(topic) {
            Some(listeners) => {
                listeners.push(listener);
                false
            }
            None => {
                topics.insert(topic.to_string(), vec![listener]);
                true
            }
        }
    }

    /// Drop every listener on `topic`. Returns true if there were any.
    pub(crate) fn remove_topic(&self, topic: &str) -> bool {
        match self.lock().remove(topic) {
            Some(listeners) => {
                deactivate(&listeners);
                true
            }
            None => false,
        }
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Remove everything. Listeners already handed to a dispatcher stop firing.
    pub(crate) fn clear(&self) {
        let removed = std::mem::take(&mut *self.lock());
        for listeners in removed.values() {
            deactivate(listeners);
        }
    }

    pub(crate) fn dispatch(&self, event: &PropertyEvent) {
        let listeners = match self.lock().get(&event.topic) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        for listener in listeners {
            if listener.active.load(Ordering::SeqCst) && listener.wants(event) {
                (listener.callback)(event.value.clone());
            }
        }
    }
}

fn deactivate(listeners: &[Arc<Listener>]) {
    for listener in listeners {
        listener.active.store(false, Ordering::SeqCst);
    }
}

/// Deliver events from one link to the registry until the link goes away.
pub(crate) fn spawn_dispatcher(
    registry: Arc<Registry>,
    mut events: mpsc::UnboundedReceiver<PropertyEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            registry.dispatch(&event);
        }
        log::debug!("Event stream closed, dispatcher stopping");
    })
}
