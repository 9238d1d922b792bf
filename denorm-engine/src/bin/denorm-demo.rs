//! House/Tenant walkthrough on in-memory stores.
//!
//! A tenant embeds a mirror of its house. Changing the house address and
//! notifying the engine refreshes the tenant in the background.

use denorm_core::{
    id_value, DenormResult, Document, FieldSpec, MirrorSpec, ModelSchema, SnapshotSchema,
};
use denorm_engine::{init_tracing, CascadeEngine, EngineConfig, TelemetryConfig};
use denorm_storage::{DocumentStore, InMemoryDocumentStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[tokio::main]
async fn main() -> DenormResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let schema = SnapshotSchema::builder()
        .mirror(MirrorSpec::new("HouseMirror", "House").field(FieldSpec::scalar("address")))
        .model(ModelSchema::new("House"))
        .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
        .build()?;

    let documents = Arc::new(InMemoryDocumentStore::new());
    let engine = CascadeEngine::builder()
        .schema(schema)
        .documents(documents.clone())
        .config(EngineConfig::development())
        .build()?;

    let house = documents
        .insert("House", document(json!({ "address": "1 Old Road" })))
        .await;
    let tenant = documents
        .insert(
            "Tenant",
            document(json!({
                "name": "T1",
                "house": { "id": id_value(house), "address": "1 Old Road" },
            })),
        )
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = engine.spawn_workers(shutdown_rx);

    let changed = ["address".to_string()];
    let (_, report) = engine
        .commit_then_notify(
            documents.update_fields_by_id("House", house, document(json!({ "address": "2 New Street" }))),
            "House",
            house,
            Some(&changed),
        )
        .await?;
    tracing::info!(accepted = report.accepted(), "House address changed");

    for _ in 0..100 {
        if engine.stats().await?.outstanding() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let refreshed = documents.get_by_id("Tenant", tenant).await?;
    let address = refreshed
        .as_ref()
        .and_then(|t| t.get("house"))
        .and_then(|h| h.get("address"))
        .cloned()
        .unwrap_or(Value::Null);
    tracing::info!(tenant = %tenant, address = %address, "Tenant mirror refreshed");

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Cascade worker did not stop cleanly");
        }
    }

    let metrics = engine.metrics();
    tracing::info!(
        executed = metrics.tasks_executed,
        written = metrics.targets_written,
        "Demo complete"
    );
    Ok(())
}
