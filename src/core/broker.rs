//! Durability-first publish/subscribe.
//!
//! `publish` appends to the [`FactLog`] first and only then hands the fact to
//! a single background delivery thread. Subscribers for a kind are invoked in
//! publish order on that thread; a failing or panicking subscriber is logged
//! and skipped without affecting the publisher or other subscribers. Because
//! the fact is already durable, anything lost in live delivery can be read
//! back from the log.
//!
//! Subscribers may publish from inside their callback (agents do). The
//! pending-delivery counter is raised before the parent delivery finishes, so
//! [`Broker::flush`] waits for whole cascades.

use crate::core::error::FactflowError;
use crate::core::fact::Fact;
use crate::core::fact_log::FactLog;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

/// Something that accepts published facts. The [`Broker`] is the production
/// sink; agents only see this seam.
pub trait FactSink: Send + Sync {
    /// `Ok(true)` once the fact is durable, `Ok(false)` if it was refused.
    fn publish(&self, fact: Fact) -> Result<bool, FactflowError>;
}

/// A fan-out target registered for one or more kinds.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str {
        "subscriber"
    }

    fn on_fact(&self, fact: &Fact) -> Result<(), FactflowError>;
}

/// Adapter turning a closure into a [`Subscriber`].
pub struct FnSubscriber<F> {
    name: String,
    f: F,
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&Fact) -> Result<(), FactflowError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_fact(&self, fact: &Fact) -> Result<(), FactflowError> {
        (self.f)(fact)
    }
}

pub fn subscriber_fn<F>(name: &str, f: F) -> Arc<dyn Subscriber>
where
    F: Fn(&Fact) -> Result<(), FactflowError> + Send + Sync + 'static,
{
    Arc::new(FnSubscriber {
        name: name.to_string(),
        f,
    })
}

type Registry = HashMap<String, Vec<Arc<dyn Subscriber>>>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn raise(&self) -> Result<(), FactflowError> {
        let mut n = self
            .count
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("broker pending counter"))?;
        *n += 1;
        Ok(())
    }

    fn lower(&self) {
        if let Ok(mut n) = self.count.lock() {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.idle.notify_all();
            }
        }
    }
}

pub struct Broker {
    log: Arc<FactLog>,
    registry: Arc<RwLock<Registry>>,
    sender: Mutex<Option<mpsc::Sender<Fact>>>,
    pending: Arc<Pending>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

pub fn channel_name(kind: &str) -> String {
    format!("facts:{kind}")
}

impl Broker {
    /// Bind a broker to `log` and spawn its delivery thread.
    pub fn new(log: Arc<FactLog>) -> Result<Self, FactflowError> {
        let (tx, rx) = mpsc::channel::<Fact>();
        let registry: Arc<RwLock<Registry>> = Arc::new(RwLock::new(HashMap::new()));
        let pending = Arc::new(Pending::default());

        let worker_registry = Arc::clone(&registry);
        let worker_pending = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("factflow-delivery".into())
            .spawn(move || {
                for fact in rx {
                    deliver(&worker_registry, &fact);
                    worker_pending.lower();
                }
                tracing::debug!("delivery worker drained and stopped");
            })?;
        let worker_id = handle.thread().id();

        Ok(Self {
            log,
            registry,
            sender: Mutex::new(Some(tx)),
            pending,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    pub fn fact_log(&self) -> &Arc<FactLog> {
        &self.log
    }

    /// Append durably, then queue for fan-out. Never waits on subscribers.
    pub fn publish(&self, fact: Fact) -> Result<bool, FactflowError> {
        let outcome = self.log.append(&fact)?;
        if !outcome.accepted() {
            tracing::warn!(fact_id = fact.id(), kind = fact.kind(), "publish refused by fact log");
            return Ok(false);
        }

        let sender = self
            .sender
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("broker sender"))?;
        let Some(tx) = sender.as_ref() else {
            tracing::warn!(fact_id = fact.id(), "broker closed; fact stored but not delivered");
            return Err(FactflowError::LifecycleError(format!(
                "broker closed, fact {} is durable but was not delivered",
                fact.id()
            )));
        };

        self.pending.raise()?;
        let fact_id = fact.id().to_string();
        let channel = channel_name(fact.kind());
        if tx.send(fact).is_err() {
            self.pending.lower();
            return Err(FactflowError::LifecycleError(format!(
                "delivery worker gone, fact {fact_id} is durable but was not delivered"
            )));
        }
        tracing::debug!(fact_id = %fact_id, channel = %channel, "fact published");
        Ok(true)
    }

    /// Register `subscriber` for `kind`. Registering the same `Arc` twice is a no-op.
    pub fn subscribe(&self, kind: &str, subscriber: Arc<dyn Subscriber>) -> Result<bool, FactflowError> {
        let mut reg = self
            .registry
            .write()
            .map_err(|_| FactflowError::LockPoisoned("broker registry"))?;
        let subs = reg.entry(kind.to_string()).or_default();
        if subs.iter().any(|s| Arc::ptr_eq(s, &subscriber)) {
            return Ok(false);
        }
        tracing::debug!(channel = %channel_name(kind), subscriber = subscriber.name(), "subscribed");
        subs.push(subscriber);
        Ok(true)
    }

    /// Remove `subscriber` from `kind`; `None` removes every subscriber of the
    /// kind. The channel entry is released once it has no subscribers left.
    pub fn unsubscribe(
        &self,
        kind: &str,
        subscriber: Option<&Arc<dyn Subscriber>>,
    ) -> Result<bool, FactflowError> {
        let mut reg = self
            .registry
            .write()
            .map_err(|_| FactflowError::LockPoisoned("broker registry"))?;
        let Some(subs) = reg.get_mut(kind) else {
            return Ok(false);
        };
        let before = subs.len();
        match subscriber {
            Some(target) => subs.retain(|s| !Arc::ptr_eq(s, target)),
            None => subs.clear(),
        }
        let removed = subs.len() != before;
        if subs.is_empty() {
            reg.remove(kind);
            tracing::debug!(channel = %channel_name(kind), "channel released");
        }
        Ok(removed)
    }

    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.registry
            .read()
            .map(|r| r.get(kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Block until every queued delivery, including cascades, has run.
    /// Must not be called from a subscriber callback.
    pub fn flush(&self) -> Result<(), FactflowError> {
        self.ensure_off_worker("flush")?;
        let mut n = self
            .pending
            .count
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("broker pending counter"))?;
        while *n > 0 {
            n = self
                .pending
                .idle
                .wait(n)
                .map_err(|_| FactflowError::LockPoisoned("broker pending counter"))?;
        }
        Ok(())
    }

    /// Drain outstanding deliveries, then stop and join the delivery thread.
    pub fn close(&self) -> Result<(), FactflowError> {
        self.ensure_off_worker("close")?;
        self.flush()?;
        let tx = self
            .sender
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("broker sender"))?
            .take();
        drop(tx);
        let handle = self
            .worker
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("broker worker"))?
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("delivery worker panicked during shutdown");
            }
            tracing::info!("broker closed");
        }
        Ok(())
    }

    fn ensure_off_worker(&self, op: &str) -> Result<(), FactflowError> {
        if thread::current().id() == self.worker_id {
            return Err(FactflowError::LifecycleError(format!(
                "broker.{op} called from the delivery thread"
            )));
        }
        Ok(())
    }
}

impl FactSink for Broker {
    fn publish(&self, fact: Fact) -> Result<bool, FactflowError> {
        Broker::publish(self, fact)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if thread::current().id() != self.worker_id {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "broker close on drop failed");
            }
        }
    }
}

fn deliver(registry: &RwLock<Registry>, fact: &Fact) {
    let subs: Vec<Arc<dyn Subscriber>> = match registry.read() {
        Ok(reg) => reg.get(fact.kind()).cloned().unwrap_or_default(),
        Err(_) => {
            tracing::error!(fact_id = fact.id(), "broker registry poisoned, dropping live delivery");
            return;
        }
    };
    for sub in subs {
        match panic::catch_unwind(AssertUnwindSafe(|| sub.on_fact(fact))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                fact_id = fact.id(),
                kind = fact.kind(),
                subscriber = sub.name(),
                error = %e,
                "subscriber failed"
            ),
            Err(_) => tracing::error!(
                fact_id = fact.id(),
                kind = fact.kind(),
                subscriber = sub.name(),
                "subscriber panicked"
            ),
        }
    }
}
