//! Shared agent plumbing: the [`Agent`] trait, its lifecycle wrapper and the
//! sinks agents publish through.
//!
//! An agent only sees facts of the kinds in its dispatch table, and only while
//! its handle is `Running`. Whatever goes wrong inside a handler (an error or a
//! panic) is logged against the agent's name and swallowed, so one agent can
//! never stall broker delivery for the others.

use crate::core::broker::{Broker, FactSink, Subscriber};
use crate::core::error::FactflowError;
use crate::core::fact::Fact;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Handler for one fact kind, as stored in an agent's dispatch table.
pub type KindHandler<A> = fn(&A, &Fact, &dyn FactSink) -> Result<(), FactflowError>;

pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Fact kinds this agent consumes.
    fn kinds(&self) -> Vec<&'static str>;

    /// Process one fact of a consumed kind, publishing derived facts to `sink`.
    fn handle(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError>;

    /// Forget all private derived state.
    fn reset(&self);
}

/// Route `fact` to the handler registered for its kind; unknown kinds are ignored.
pub fn dispatch<A>(
    table: &[(&'static str, KindHandler<A>)],
    agent: &A,
    fact: &Fact,
    sink: &dyn FactSink,
) -> Result<(), FactflowError> {
    match table.iter().find(|(kind, _)| *kind == fact.kind()) {
        Some((_, handler)) => handler(agent, fact, sink),
        None => Ok(()),
    }
}

pub fn table_kinds<A>(table: &[(&'static str, KindHandler<A>)]) -> Vec<&'static str> {
    table.iter().map(|(kind, _)| *kind).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct AgentCore {
    agent: Box<dyn Agent>,
    kinds: FxHashSet<&'static str>,
    state: Mutex<LifecycleState>,
    broker: Mutex<Option<Weak<Broker>>>,
    processed: AtomicU64,
}

impl AgentCore {
    fn state(&self) -> LifecycleState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(LifecycleState::Stopped)
    }

    fn set_state(&self, next: LifecycleState) -> Result<(), FactflowError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("agent state"))?;
        tracing::debug!(agent = self.agent.name(), from = state.as_str(), to = next.as_str(), "agent state change");
        *state = next;
        Ok(())
    }

    fn should_process(&self, fact: &Fact) -> bool {
        self.kinds.contains(fact.kind()) && self.state() == LifecycleState::Running
    }

    /// Run the agent's handler with errors and panics contained.
    fn run_handler(&self, fact: &Fact, sink: &dyn FactSink) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.agent.handle(fact, sink)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                agent = self.agent.name(),
                fact_id = fact.id(),
                kind = fact.kind(),
                error = %e,
                "agent handler failed"
            ),
            Err(_) => tracing::error!(
                agent = self.agent.name(),
                fact_id = fact.id(),
                kind = fact.kind(),
                "agent handler panicked"
            ),
        }
    }
}

impl Subscriber for AgentCore {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn on_fact(&self, fact: &Fact) -> Result<(), FactflowError> {
        if !self.should_process(fact) {
            return Ok(());
        }
        let broker = self
            .broker
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("agent broker"))?
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(broker) = broker else {
            tracing::warn!(agent = self.agent.name(), fact_id = fact.id(), "broker gone, fact skipped");
            return Ok(());
        };
        self.run_handler(fact, &*broker);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Lifecycle wrapper around an [`Agent`]:
/// `Uninitialized -> Initialized -> Running -> Stopped`.
pub struct AgentHandle {
    core: Arc<AgentCore>,
}

impl AgentHandle {
    pub fn new(agent: impl Agent) -> Self {
        Self::from_boxed(Box::new(agent))
    }

    pub fn from_boxed(agent: Box<dyn Agent>) -> Self {
        let kinds = agent.kinds().into_iter().collect();
        Self {
            core: Arc::new(AgentCore {
                agent,
                kinds,
                state: Mutex::new(LifecycleState::Uninitialized),
                broker: Mutex::new(None),
                processed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.core.agent.name()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.core.agent.kinds()
    }

    pub fn state(&self) -> LifecycleState {
        self.core.state()
    }

    /// Facts delivered to the handler while running.
    pub fn processed_count(&self) -> u64 {
        self.core.processed.load(Ordering::Relaxed)
    }

    pub fn should_process(&self, fact: &Fact) -> bool {
        self.core.should_process(fact)
    }

    /// Bind the broker the agent will publish through.
    pub fn initialize(&self, broker: &Arc<Broker>) -> Result<(), FactflowError> {
        if self.state() == LifecycleState::Running {
            return Err(FactflowError::LifecycleError(format!(
                "agent {} is running; stop it before re-initializing",
                self.name()
            )));
        }
        *self
            .core
            .broker
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("agent broker"))? = Some(Arc::downgrade(broker));
        self.core.set_state(LifecycleState::Initialized)
    }

    /// Subscribe to every consumed kind. A no-op when already running.
    pub fn start(&self) -> Result<(), FactflowError> {
        match self.state() {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Uninitialized => {
                return Err(FactflowError::LifecycleError(format!(
                    "agent {} started before initialize",
                    self.name()
                )));
            }
            LifecycleState::Initialized | LifecycleState::Stopped => {}
        }
        let broker = self.bound_broker()?;
        let sub = self.subscriber();
        for kind in &self.core.kinds {
            broker.subscribe(kind, Arc::clone(&sub))?;
        }
        self.core.set_state(LifecycleState::Running)?;
        tracing::info!(agent = self.name(), kinds = ?self.kinds(), "agent started");
        Ok(())
    }

    /// Unsubscribe from every kind. Callbacks already dispatched still finish.
    pub fn stop(&self) -> Result<(), FactflowError> {
        if self.state() != LifecycleState::Running {
            return Ok(());
        }
        self.core.set_state(LifecycleState::Stopped)?;
        if let Ok(broker) = self.bound_broker() {
            let sub = self.subscriber();
            for kind in &self.core.kinds {
                broker.unsubscribe(kind, Some(&sub))?;
            }
        }
        tracing::info!(agent = self.name(), processed = self.processed_count(), "agent stopped");
        Ok(())
    }

    /// Replay `facts` into the agent's private state without publishing
    /// anything. Only allowed while the agent is not running.
    pub fn hydrate(&self, facts: &[Fact]) -> Result<usize, FactflowError> {
        if self.state() == LifecycleState::Running {
            return Err(FactflowError::LifecycleError(format!(
                "agent {} cannot hydrate while running",
                self.name()
            )));
        }
        let mut fed = 0;
        for fact in facts.iter().filter(|f| self.core.kinds.contains(f.kind())) {
            self.core.run_handler(fact, &DiscardSink);
            fed += 1;
        }
        tracing::debug!(agent = self.name(), facts = fed, "agent hydrated");
        Ok(fed)
    }

    pub fn reset(&self) {
        self.core.agent.reset();
    }

    fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::clone(&self.core) as Arc<dyn Subscriber>
    }

    fn bound_broker(&self) -> Result<Arc<Broker>, FactflowError> {
        self.core
            .broker
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("agent broker"))?
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                FactflowError::LifecycleError(format!("agent {} has no live broker", self.name()))
            })
    }
}

/// Accepts and drops every fact. Used for hydration.
pub struct DiscardSink;

impl FactSink for DiscardSink {
    fn publish(&self, _fact: Fact) -> Result<bool, FactflowError> {
        Ok(true)
    }
}

/// Collects published facts in memory.
#[derive(Default)]
pub struct RecordingSink {
    facts: Mutex<Vec<Fact>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts(&self) -> Vec<Fact> {
        self.facts.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<Fact> {
        self.facts()
            .into_iter()
            .filter(|f| f.kind() == kind)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut f) = self.facts.lock() {
            f.clear();
        }
    }
}

impl FactSink for RecordingSink {
    fn publish(&self, fact: Fact) -> Result<bool, FactflowError> {
        self.facts
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("recording sink"))?
            .push(fact);
        Ok(true)
    }
}
