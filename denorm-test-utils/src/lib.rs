//! Denorm Test Utilities
//!
//! Centralized test infrastructure for the denorm workspace:
//! - Failing and recording collaborators
//! - Schema and document fixtures for common cascade shapes
//! - Proptest generators for source states

// Re-export core types for convenience
pub use denorm_core::{
    id_value, new_entity_id, DenormError, DenormResult, Document, EntityId, FieldSpec,
    MirrorSource, MirrorSpec, ModelSchema, SnapshotSchema, StorageError, TaskKey,
};
pub use denorm_storage::{DocumentStore, InMemoryDocumentStore, InMemoryTaskStore, TaskStore};

use async_trait::async_trait;
use denorm_core::{ClaimedTask, DenormalizationTask, Filter, HandlerError, Timestamp};
use denorm_engine::{CustomHandler, HandlerContext, HandlerOutcome};
use denorm_storage::{CompletionOutcome, EnqueueOutcome, FailureOutcome, TaskStats};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// ============================================================================
// FAILING COLLABORATORS
// ============================================================================

fn unavailable() -> DenormError {
    StorageError::Unavailable {
        reason: "injected failure".to_string(),
    }
    .into()
}

/// Task store that rejects every operation.
#[derive(Debug, Default)]
pub struct FailingTaskStore;

#[async_trait]
impl TaskStore for FailingTaskStore {
    async fn enqueue(&self, _task: DenormalizationTask) -> DenormResult<EnqueueOutcome> {
        Err(unavailable())
    }

    async fn claim(&self, _key: &TaskKey, _lease: Duration) -> DenormResult<Option<ClaimedTask>> {
        Err(unavailable())
    }

    async fn claim_next(&self, _lease: Duration) -> DenormResult<Option<ClaimedTask>> {
        Err(unavailable())
    }

    async fn complete(&self, _claimed: ClaimedTask) -> DenormResult<CompletionOutcome> {
        Err(unavailable())
    }

    async fn fail(
        &self,
        _claimed: ClaimedTask,
        _error: &str,
        _retry_at: Timestamp,
        _max_attempts: u32,
    ) -> DenormResult<FailureOutcome> {
        Err(unavailable())
    }

    async fn get(&self, _key: &TaskKey) -> DenormResult<Option<DenormalizationTask>> {
        Err(unavailable())
    }

    async fn parked(&self) -> DenormResult<Vec<DenormalizationTask>> {
        Err(unavailable())
    }

    async fn revive(&self, _key: &TaskKey) -> DenormResult<bool> {
        Err(unavailable())
    }

    async fn stats(&self) -> DenormResult<TaskStats> {
        Err(unavailable())
    }
}

/// In-memory document store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyDocumentStore {
    pub inner: InMemoryDocumentStore,
    fail_writes: AtomicBool,
}

impl FlakyDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn get_by_id(&self, model: &str, id: EntityId) -> DenormResult<Option<Document>> {
        self.inner.get_by_id(model, id).await
    }

    async fn find_by_filter(&self, model: &str, filter: &Filter) -> DenormResult<Vec<Document>> {
        self.inner.find_by_filter(model, filter).await
    }

    async fn update_fields_by_id(
        &self,
        model: &str,
        id: EntityId,
        fields: Document,
    ) -> DenormResult<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.update_fields_by_id(model, id, fields).await
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// One recorded handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerCall {
    pub key: TaskKey,
    pub params: Value,
}

/// Handler that records its calls and reports configured touched ids.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<HandlerCall>>,
    touched: Vec<EntityId>,
    fail_with: Option<String>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handler that reports `touched` as changed after every run.
    pub fn touching(touched: Vec<EntityId>) -> Arc<Self> {
        Arc::new(Self {
            touched,
            ..Self::default()
        })
    }

    /// Handler that records the call, then fails.
    pub fn failing(reason: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        })
    }

    pub async fn calls(&self) -> Vec<HandlerCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CustomHandler for RecordingHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<HandlerOutcome, HandlerError> {
        self.calls.lock().await.push(HandlerCall {
            key: ctx.task.key.clone(),
            params: ctx.params().clone(),
        });
        match &self.fail_with {
            Some(reason) => Err(HandlerError::new(reason.clone())),
            None => Ok(HandlerOutcome::touched(self.touched.iter().copied())),
        }
    }
}

/// Handler that sleeps before succeeding and records how many of its runs
/// overlapped. A run cut off mid-sleep still counts as finished.
pub struct SlowHandler {
    delay: Duration,
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveRun<'a>(&'a AtomicUsize);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    /// Runs started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Largest number of runs in progress at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomHandler for SlowHandler {
    async fn handle(&self, _ctx: HandlerContext<'_>) -> Result<HandlerOutcome, HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);
        let _run = ActiveRun(&self.active);
        tokio::time::sleep(self.delay).await;
        Ok(HandlerOutcome::default())
    }
}

// ============================================================================
// TYPED SOURCE ENTITIES
// ============================================================================

/// Live House instance, as a business subsystem would hold it.
#[derive(Debug, Clone, PartialEq)]
pub struct House {
    pub id: EntityId,
    pub address: String,
    pub rent: i64,
}

impl MirrorSource for House {
    fn source_id(&self) -> EntityId {
        self.id
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "address" => Some(Value::from(self.address.clone())),
            "rent" => Some(Value::from(self.rent)),
            _ => None,
        }
    }

    fn related(&self, _name: &str) -> Option<&dyn MirrorSource> {
        None
    }
}

impl House {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            address: address.into(),
            rent: 1_000,
        }
    }

    /// Stored form, as the document store would persist it.
    pub fn to_document(&self) -> Document {
        fixtures::doc(serde_json::json!({
            "_id": id_value(self.id),
            "address": self.address,
            "rent": self.rent,
        }))
    }
}

/// Live Tenant instance with its loaded house.
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    pub id: EntityId,
    pub name: String,
    pub house: Option<House>,
}

impl MirrorSource for Tenant {
    fn source_id(&self) -> EntityId {
        self.id
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::from(self.name.clone())),
            _ => None,
        }
    }

    fn related(&self, name: &str) -> Option<&dyn MirrorSource> {
        match name {
            "house" => self.house.as_ref().map(|h| h as &dyn MirrorSource),
            _ => None,
        }
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Generate a street address.
    pub fn arb_address() -> impl Strategy<Value = String> {
        "[1-9][0-9]{0,3} [A-Z][a-z]{2,10} (Street|Road|Avenue)"
    }

    /// Generate a House with a fresh id.
    pub fn arb_house() -> impl Strategy<Value = House> {
        (arb_address(), 100i64..10_000).prop_map(|(address, rent)| House {
            id: new_entity_id(),
            address,
            rent,
        })
    }

    /// Generate a Tenant, sometimes without a loaded house.
    pub fn arb_tenant() -> impl Strategy<Value = Tenant> {
        ("[A-Z][a-z]{2,12}", proptest::option::of(arb_house())).prop_map(|(name, house)| Tenant {
            id: new_entity_id(),
            name,
            house,
        })
    }

    /// Generate a sequence of address writes for one house.
    pub fn arb_address_history() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(arb_address(), 1..8)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use serde_json::json;

    /// Convert a JSON object literal into a document.
    pub fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    /// `House → [Tenant]`; Tenant embeds `{id, address, rent}`.
    pub fn house_tenant_schema() -> SnapshotSchema {
        SnapshotSchema::builder()
            .mirror(
                MirrorSpec::new("HouseMirror", "House")
                    .field(FieldSpec::scalar("address"))
                    .field(FieldSpec::scalar("rent")),
            )
            .model(ModelSchema::new("House"))
            .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
            .build()
            .expect("house/tenant schema is valid")
    }

    /// `House → [Tenant] → [Statement]`; Statement embeds the tenant mirror,
    /// which nests the house mirror.
    pub fn statement_schema() -> SnapshotSchema {
        SnapshotSchema::builder()
            .mirror(
                MirrorSpec::new("HouseMirror", "House")
                    .field(FieldSpec::scalar("address"))
                    .field(FieldSpec::scalar("rent")),
            )
            .mirror(
                MirrorSpec::new("TenantMirror", "Tenant")
                    .field(FieldSpec::scalar("name"))
                    .field(FieldSpec::nested("house", "HouseMirror")),
            )
            .model(ModelSchema::new("House"))
            .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
            .model(ModelSchema::new("Statement").mirror("tenant", "TenantMirror"))
            .build()
            .expect("statement schema is valid")
    }

    /// `House → [Tenant]` plus `Owner.house_count`, maintained by the
    /// `count_houses` handler whenever a House changes.
    pub fn owner_count_schema() -> SnapshotSchema {
        SnapshotSchema::builder()
            .mirror(
                MirrorSpec::new("HouseMirror", "House")
                    .field(FieldSpec::scalar("address"))
                    .field(FieldSpec::scalar("rent")),
            )
            .model(ModelSchema::new("House"))
            .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
            .model(ModelSchema::new("Owner").computed(
                "house_count",
                "House",
                "count_houses",
                json!({ "status": "active" }),
            ))
            .build()
            .expect("owner count schema is valid")
    }

    /// `House → [Tenant] → [Owner]`: Owner's `rent_total` is maintained by
    /// the `sum_rent` handler whenever a Tenant changes, including when a
    /// House change rewrites the tenant's mirror.
    pub fn tenant_rent_schema() -> SnapshotSchema {
        SnapshotSchema::builder()
            .mirror(
                MirrorSpec::new("HouseMirror", "House")
                    .field(FieldSpec::scalar("address"))
                    .field(FieldSpec::scalar("rent")),
            )
            .model(ModelSchema::new("House"))
            .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
            .model(ModelSchema::new("Owner").computed(
                "rent_total",
                "Tenant",
                "sum_rent",
                json!({ "currency": "EUR" }),
            ))
            .build()
            .expect("tenant rent schema is valid")
    }

    fn source_mirrors() -> Vec<MirrorSpec> {
        vec![
            MirrorSpec::new("SourceMirror", "Source").field(FieldSpec::scalar("title")),
            MirrorSpec::new("AMirror", "A")
                .field(FieldSpec::scalar("label"))
                .field(FieldSpec::nested("source", "SourceMirror")),
            MirrorSpec::new("BMirror", "B")
                .field(FieldSpec::scalar("label"))
                .field(FieldSpec::nested("source", "SourceMirror")),
        ]
    }

    fn with_models(models: Vec<ModelSchema>) -> SnapshotSchema {
        let mut builder = SnapshotSchema::builder();
        for spec in source_mirrors() {
            builder = builder.mirror(spec);
        }
        for model in models {
            builder = builder.model(model);
        }
        builder.build().expect("fixture schema is valid")
    }

    /// `Source → [A, B]`, `A → [C]`, `B → [C]`.
    pub fn diamond_schema() -> SnapshotSchema {
        with_models(vec![
            ModelSchema::new("Source"),
            ModelSchema::new("A").mirror("source", "SourceMirror"),
            ModelSchema::new("B").mirror("source", "SourceMirror"),
            ModelSchema::new("C").mirror("a", "AMirror").mirror("b", "BMirror"),
        ])
    }

    /// `Source → [A, B]`, `A → [C]`.
    pub fn chain_schema() -> SnapshotSchema {
        with_models(vec![
            ModelSchema::new("Source"),
            ModelSchema::new("A").mirror("source", "SourceMirror"),
            ModelSchema::new("B").mirror("source", "SourceMirror"),
            ModelSchema::new("C").mirror("a", "AMirror"),
        ])
    }

    /// Stored House document.
    pub fn house_doc(address: &str) -> Document {
        doc(json!({ "address": address, "rent": 1_000 }))
    }

    /// Stored Tenant document embedding a (possibly stale) house mirror.
    pub fn tenant_doc(name: &str, house_id: EntityId, address: &str) -> Document {
        doc(json!({
            "name": name,
            "house": { "id": id_value(house_id), "address": address, "rent": 1_000 },
        }))
    }
}
