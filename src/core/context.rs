//! Runtime wiring for one store: pool, fact log, broker, projector and agents.
//!
//! Nothing here is process-global; every test or command builds its own
//! [`Context`] on its own store root.

use crate::core::broker::Broker;
use crate::core::config::Config;
use crate::core::error::FactflowError;
use crate::core::fact::Fact;
use crate::core::fact_log::FactLog;
use crate::core::pool::SqlitePool;
use crate::core::projector::ViewProjector;
use crate::core::store::Store;
use crate::plugins::{self, agent::AgentHandle};
use std::sync::Arc;

pub struct Context {
    store: Store,
    config: Config,
    log: Arc<FactLog>,
    broker: Arc<Broker>,
    projector: Arc<ViewProjector>,
    agents: Vec<AgentHandle>,
}

impl Context {
    /// Open both databases, attach the projector and initialize the enabled
    /// agents. Agents are not subscribed until [`Context::start_agents`].
    pub fn open(store: Store, config: Config) -> Result<Self, FactflowError> {
        let pool = Arc::new(SqlitePool::new());
        let log = Arc::new(FactLog::open(Arc::clone(&pool), &store)?);
        let projector = Arc::new(ViewProjector::open(Arc::clone(&pool), &store)?);
        let broker = Arc::new(Broker::new(Arc::clone(&log))?);
        projector.attach(&broker)?;

        let agents = config
            .agents
            .enabled
            .iter()
            .map(|name| {
                let handle = plugins::build_agent(name)?;
                handle.initialize(&broker)?;
                Ok(handle)
            })
            .collect::<Result<Vec<_>, FactflowError>>()?;

        tracing::debug!(root = %store.root.display(), agents = agents.len(), "context opened");
        Ok(Self {
            store,
            config,
            log,
            broker,
            projector,
            agents,
        })
    }

    /// Optionally warm agent caches from the log, then subscribe every agent.
    pub fn start_agents(&self) -> Result<(), FactflowError> {
        if self.config.agents.hydrate {
            let facts = self.log.all_in_order()?;
            for agent in &self.agents {
                agent.reset();
                agent.hydrate(&facts)?;
            }
        }
        for agent in &self.agents {
            agent.start()?;
        }
        Ok(())
    }

    pub fn stop_agents(&self) -> Result<(), FactflowError> {
        for agent in &self.agents {
            agent.stop()?;
        }
        Ok(())
    }

    pub fn publish(&self, fact: Fact) -> Result<bool, FactflowError> {
        self.broker.publish(fact)
    }

    /// Wait until every queued delivery and every cascade it triggers has run.
    pub fn flush(&self) -> Result<(), FactflowError> {
        self.broker.flush()
    }

    /// Stop agents, drain deliveries, detach the projector and join the worker.
    pub fn shutdown(&self) -> Result<(), FactflowError> {
        self.stop_agents()?;
        self.broker.flush()?;
        self.projector.close(&self.broker)?;
        self.broker.close()?;
        tracing::debug!(root = %self.store.root.display(), "context shut down");
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fact_log(&self) -> &Arc<FactLog> {
        &self.log
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn projector(&self) -> &Arc<ViewProjector> {
        &self.projector
    }

    pub fn agents(&self) -> &[AgentHandle] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&AgentHandle> {
        self.agents.iter().find(|a| a.name() == name)
    }
}
