//! Live workflow instances, one per operator session.
//!
//! Operators abandon sessions by navigating away, so instances nobody has
//! touched or watched for a while are swept out.

use super::{Collaborators, Workflow};
use crate::config::SessionConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

struct Entry {
    workflow: Arc<Workflow>,
    touched: Instant,
}

pub struct WorkflowRegistry {
    collaborators: Arc<Collaborators>,
    workflows: RwLock<HashMap<Uuid, Entry>>,
}

impl WorkflowRegistry {
    pub fn new(collaborators: Arc<Collaborators>) -> Self {
        Self {
            collaborators,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Start a new workflow in `Idle`
    pub fn create(&self) -> Arc<Workflow> {
        let workflow = Arc::new(Workflow::new(self.collaborators.clone()));
        self.workflows.write().insert(
            workflow.id(),
            Entry {
                workflow: workflow.clone(),
                touched: Instant::now(),
            },
        );

        metrics::gauge!("photo.workflows.active").set(self.len() as f64);
        info!(workflow_id = %workflow.id(), "Workflow created");
        workflow
    }

    /// Look up a workflow and mark it as in use.
    pub fn get(&self, id: Uuid) -> Option<Arc<Workflow>> {
        let mut workflows = self.workflows.write();
        let entry = workflows.get_mut(&id)?;
        entry.touched = Instant::now();
        Some(entry.workflow.clone())
    }

    /// Drop a workflow, cancelling anything it still has in flight.
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.workflows.write().remove(&id);
        match removed {
            Some(entry) => {
                entry.workflow.reset();
                metrics::gauge!("photo.workflows.active").set(self.len() as f64);
                info!(workflow_id = %id, "Workflow removed");
                true
            }
            None => false,
        }
    }

    /// Reset and drop every workflow untouched for `idle` that has nothing
    /// running and no observers. Returns how many went.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<Arc<Workflow>> = {
            let mut workflows = self.workflows.write();
            let ids: Vec<Uuid> = workflows
                .iter()
                .filter(|(_, e)| now.duration_since(e.touched) >= idle && e.workflow.is_idle())
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| workflows.remove(id))
                .map(|e| e.workflow)
                .collect()
        };

        if evicted.is_empty() {
            return 0;
        }

        for workflow in &evicted {
            workflow.reset();
            debug!(workflow_id = %workflow.id(), "Idle workflow evicted");
        }

        metrics::counter!("photo.workflows.evicted").increment(evicted.len() as u64);
        metrics::gauge!("photo.workflows.active").set(self.len() as f64);
        info!(evicted = evicted.len(), remaining = self.len(), "Evicted idle workflows");
        evicted.len()
    }

    /// Periodically evict idle workflows until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, config: &SessionConfig) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let idle = config.idle_timeout();
        let every = config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.evict_idle(idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }
}
