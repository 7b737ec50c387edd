//! Registries: idempotent persistence facades over the document store
//!
//! Registration of every entity goes through [`upsert_merge`]: insert, and on
//! a duplicate key merge the incoming record over the stored one and write
//! once more. A second failure is returned to the caller.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::component::WorkflowComponent;
use crate::domain::events::Event;
use crate::domain::execution::WorkflowExecution;
use crate::domain::process::Process;
use crate::domain::repository::{Document, DocumentRepository, Versioned};
use crate::domain::workflow::Workflow;
use crate::types::{CorrelationId, EventId, WorkflowExecutionId, WorkflowId};
use crate::CoreError;

const CORRELATION_INDEX: &str = "correlationId";
const EXECUTION_INDEX: &str = "workflowExecutionId";
const WORKFLOW_INDEX: &str = "workflowId";

/// Field-wise merge of an incoming update into a stored record
pub trait Mergeable {
    /// Merge `incoming` over `self`
    fn merge_from(&mut self, incoming: Self);
}

impl Document for Workflow {
    const COLLECTION: &'static str = "workflows";

    fn id(&self) -> String {
        self.workflow_id.to_string()
    }

    fn business_key(&self) -> Option<String> {
        Some(self.domain.clone())
    }
}

impl Mergeable for Workflow {
    fn merge_from(&mut self, incoming: Self) {
        self.inflate();
        self.merge(incoming);
        self.flatten();
    }
}

impl Document for WorkflowExecution {
    const COLLECTION: &'static str = "workflow_executions";

    fn id(&self) -> String {
        self.workflow_execution_id.to_string()
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![(WORKFLOW_INDEX, self.workflow_id.to_string())]
    }
}

impl Mergeable for WorkflowExecution {
    fn merge_from(&mut self, incoming: Self) {
        self.merge(incoming);
    }
}

impl Document for WorkflowComponent {
    const COLLECTION: &'static str = "workflow_components";

    fn id(&self) -> String {
        self.component_id.clone()
    }

    fn business_key(&self) -> Option<String> {
        Some(self.domain.clone())
    }
}

impl Mergeable for WorkflowComponent {
    fn merge_from(&mut self, incoming: Self) {
        self.merge(incoming);
    }
}

impl Document for Process {
    const COLLECTION: &'static str = "processes";

    fn id(&self) -> String {
        self.process_id.clone()
    }

    fn business_key(&self) -> Option<String> {
        Some(self.domain.clone())
    }
}

impl Mergeable for Process {
    fn merge_from(&mut self, incoming: Self) {
        self.merge(incoming);
    }
}

impl Document for Event {
    const COLLECTION: &'static str = "events";

    fn id(&self) -> String {
        self.event_id.to_string()
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![
            (CORRELATION_INDEX, self.correlation_id.to_string()),
            (EXECUTION_INDEX, self.payload.execution_id().to_string()),
        ]
    }
}

/// Insert `document`, merging it over the conflicting record on a duplicate key.
///
/// The conflicting record is looked up by id, then by business key. The merged
/// record is written once; if that write fails too, the error is returned.
pub async fn upsert_merge<T, R>(repository: &R, document: T) -> Result<T, CoreError>
where
    T: Document + Mergeable,
    R: DocumentRepository<T> + ?Sized,
{
    let conflict = match repository.insert(&document).await {
        Ok(_) => return Ok(document),
        Err(e) if e.is_duplicate_key() => e,
        Err(e) => return Err(e),
    };

    let existing = match repository.find_by_id(&document.id()).await? {
        Some(found) => Some(found),
        None => match document.business_key() {
            Some(key) => repository.find_by_business_key(&key).await?,
            None => None,
        },
    };
    let Some(Versioned { document: mut merged, .. }) = existing else {
        return Err(conflict);
    };

    debug!(
        collection = T::COLLECTION,
        id = %merged.id(),
        "Duplicate key on insert, merging into stored record"
    );
    merged.merge_from(document);
    repository.save(&merged).await?;
    Ok(merged)
}

/// Workflow definitions
pub struct WorkflowRegistry {
    repository: Arc<dyn DocumentRepository<Workflow>>,
}

impl WorkflowRegistry {
    /// Registry over a store
    pub fn new(repository: Arc<dyn DocumentRepository<Workflow>>) -> Self {
        Self { repository }
    }

    /// Flatten and persist, merging into an existing record with the same id or domain
    pub async fn register(&self, mut workflow: Workflow) -> Result<WorkflowId, CoreError> {
        workflow.flatten();
        let stored = upsert_merge(self.repository.as_ref(), workflow).await?;
        info!(workflow_id = %stored.workflow_id, domain = %stored.domain, "Workflow registered");
        Ok(stored.workflow_id.clone())
    }

    /// Load and inflate by id
    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<Workflow, CoreError> {
        let found = self.repository.find_by_id(id.as_str()).await?;
        Self::inflated(found, "Workflow", id.as_str())
    }

    /// Load and inflate by domain
    pub async fn get_workflow_by_domain(&self, domain: &str) -> Result<Workflow, CoreError> {
        let found = self.repository.find_by_business_key(domain).await?;
        Self::inflated(found, "Workflow", domain)
    }

    /// Every workflow, each inflated
    pub async fn get_all(&self) -> Result<Vec<Workflow>, CoreError> {
        let mut all = self.repository.find_all().await?;
        all.iter_mut().for_each(Workflow::inflate);
        Ok(all)
    }

    /// Workflows whose domain starts with `prefix`, each inflated
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Workflow>, CoreError> {
        let mut found = self.repository.find_by_prefix(prefix).await?;
        found.iter_mut().for_each(Workflow::inflate);
        Ok(found)
    }

    /// Delete by id
    pub async fn delete(&self, id: &WorkflowId) -> Result<bool, CoreError> {
        self.repository.delete(id.as_str()).await
    }

    fn inflated(found: Option<Versioned<Workflow>>, kind: &str, id: &str) -> Result<Workflow, CoreError> {
        let mut workflow = found.ok_or_else(|| CoreError::not_found(kind, id))?.document;
        workflow.inflate();
        Ok(workflow)
    }
}

/// Workflow runs
pub struct WorkflowExecutionRegistry {
    repository: Arc<dyn DocumentRepository<WorkflowExecution>>,
    max_update_attempts: u32,
}

impl WorkflowExecutionRegistry {
    /// Registry over a store
    pub fn new(repository: Arc<dyn DocumentRepository<WorkflowExecution>>, max_update_attempts: u32) -> Self {
        Self {
            repository,
            max_update_attempts: max_update_attempts.max(1),
        }
    }

    /// Persist, merging into an existing record with the same id
    pub async fn register(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, CoreError> {
        upsert_merge(self.repository.as_ref(), execution).await
    }

    /// Load by id
    pub async fn get(&self, id: &WorkflowExecutionId) -> Result<WorkflowExecution, CoreError> {
        self.repository
            .find_by_id(id.as_str())
            .await?
            .map(|v| v.document)
            .ok_or_else(|| CoreError::not_found("WorkflowExecution", id.as_str()))
    }

    /// Runs of a workflow
    pub async fn find_by_workflow(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowExecution>, CoreError> {
        self.repository.find_by_index(WORKFLOW_INDEX, workflow_id.as_str()).await
    }

    /// Apply `change` to the stored run with compare-and-swap, re-reading and
    /// retrying on concurrent writes. `change` may run more than once.
    pub async fn update<T, F>(&self, id: &WorkflowExecutionId, mut change: F) -> Result<T, CoreError>
    where
        F: FnMut(&mut WorkflowExecution) -> Result<T, CoreError>,
    {
        for attempt in 1..=self.max_update_attempts {
            let Versioned {
                revision,
                document: mut execution,
            } = self
                .repository
                .find_by_id(id.as_str())
                .await?
                .ok_or_else(|| CoreError::not_found("WorkflowExecution", id.as_str()))?;

            let output = change(&mut execution)?;
            execution.updated_date = Utc::now();

            match self.repository.replace_if_revision(&execution, revision).await {
                Ok(_) => return Ok(output),
                Err(CoreError::ConcurrentModification(detail)) => {
                    debug!(execution_id = %id, attempt, %detail, "Execution update lost a race, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(execution_id = %id, attempts = self.max_update_attempts, "Execution update gave up");
        Err(CoreError::ConcurrentModification(format!(
            "workflow execution {} after {} attempts",
            id, self.max_update_attempts
        )))
    }
}

/// Component catalogue
pub struct WorkflowComponentRegistry {
    repository: Arc<dyn DocumentRepository<WorkflowComponent>>,
}

impl WorkflowComponentRegistry {
    /// Registry over a store
    pub fn new(repository: Arc<dyn DocumentRepository<WorkflowComponent>>) -> Self {
        Self { repository }
    }

    /// Persist, merging into an existing record with the same id or domain
    pub async fn register(&self, component: WorkflowComponent) -> Result<WorkflowComponent, CoreError> {
        let stored = upsert_merge(self.repository.as_ref(), component).await?;
        debug!(component = %stored.domain, provider = ?stored.provider, "Component registered");
        Ok(stored)
    }

    /// Load by id
    pub async fn get(&self, id: &str) -> Result<Option<WorkflowComponent>, CoreError> {
        Ok(self.repository.find_by_id(id).await?.map(|v| v.document))
    }

    /// Load by domain
    pub async fn get_by_domain(&self, domain: &str) -> Result<Option<WorkflowComponent>, CoreError> {
        Ok(self.repository.find_by_business_key(domain).await?.map(|v| v.document))
    }

    /// Every component
    pub async fn get_all(&self) -> Result<Vec<WorkflowComponent>, CoreError> {
        self.repository.find_all().await
    }
}

/// Source process definitions
pub struct ProcessRegistry {
    repository: Arc<dyn DocumentRepository<Process>>,
}

impl ProcessRegistry {
    /// Registry over a store
    pub fn new(repository: Arc<dyn DocumentRepository<Process>>) -> Self {
        Self { repository }
    }

    /// Persist, merging into an existing record with the same id or domain
    pub async fn register(&self, process: Process) -> Result<Process, CoreError> {
        upsert_merge(self.repository.as_ref(), process).await
    }

    /// Load by id
    pub async fn get(&self, id: &str) -> Result<Process, CoreError> {
        self.repository
            .find_by_id(id)
            .await?
            .map(|v| v.document)
            .ok_or_else(|| CoreError::not_found("Process", id))
    }

    /// Load by domain
    pub async fn get_by_domain(&self, domain: &str) -> Result<Process, CoreError> {
        self.repository
            .find_by_business_key(domain)
            .await?
            .map(|v| v.document)
            .ok_or_else(|| CoreError::not_found("Process", domain))
    }
}

/// Append-only event log
pub struct EventRegistry {
    repository: Arc<dyn DocumentRepository<Event>>,
    max_update_attempts: u32,
}

impl EventRegistry {
    /// Registry over a store
    pub fn new(repository: Arc<dyn DocumentRepository<Event>>, max_update_attempts: u32) -> Self {
        Self {
            repository,
            max_update_attempts: max_update_attempts.max(1),
        }
    }

    /// Append an event. Recording the same id twice is an error.
    pub async fn record(&self, event: &Event) -> Result<(), CoreError> {
        self.repository.insert(event).await.map(|_| ())
    }

    /// Load by id
    pub async fn get(&self, id: &EventId) -> Result<Option<Event>, CoreError> {
        Ok(self.repository.find_by_id(id.as_str()).await?.map(|v| v.document))
    }

    /// Events of one round trip, in recording order
    pub async fn find_by_correlation(&self, correlation_id: &CorrelationId) -> Result<Vec<Event>, CoreError> {
        self.repository
            .find_by_index(CORRELATION_INDEX, correlation_id.as_str())
            .await
    }

    /// Events of one run, in recording order
    pub async fn find_by_execution(&self, execution_id: &WorkflowExecutionId) -> Result<Vec<Event>, CoreError> {
        self.repository.find_by_index(EXECUTION_INDEX, execution_id.as_str()).await
    }

    /// Claim an event for handling by setting its processed date.
    ///
    /// Returns `true` for exactly one caller; later or concurrent callers get
    /// `false`. Gives up with `ConcurrentModification` after the configured
    /// number of lost races.
    pub async fn mark_processed(&self, id: &EventId) -> Result<bool, CoreError> {
        for attempt in 1..=self.max_update_attempts {
            let Some(Versioned {
                revision,
                document: mut event,
            }) = self.repository.find_by_id(id.as_str()).await?
            else {
                return Err(CoreError::not_found("Event", id.as_str()));
            };

            if event.is_processed() {
                return Ok(false);
            }
            event.processed_date = Some(Utc::now());

            match self.repository.replace_if_revision(&event, revision).await {
                Ok(_) => return Ok(true),
                Err(CoreError::ConcurrentModification(detail)) => {
                    debug!(event_id = %id, attempt, %detail, "Event claim lost a race, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(event_id = %id, attempts = self.max_update_attempts, "Event claim gave up");
        Err(CoreError::ConcurrentModification(format!(
            "event {} after {} attempts",
            id, self.max_update_attempts
        )))
    }
}
