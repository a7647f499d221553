mod common;

use std::sync::Arc;

use common::*;
use neuropipe_core::*;
use neuropipe_engine::*;

async fn populated_sorting_pipeline(sessions: &[i64]) -> Pipeline {
    let pipeline = pipeline(sorting_tables(), ComputeCatalog::with_builtins());
    seed(&pipeline, sessions);
    pipeline
        .populator()
        .populate_downstream(None, &PopulateOptions::default())
        .await
        .unwrap();
    pipeline
}

#[tokio::test]
async fn delete_removes_exactly_the_derived_rows() {
    let pipeline = populated_sorting_pipeline(&[1, 2]).await;
    assert_eq!(count(&pipeline, "Units"), 8);

    let plan = pipeline.cascade().delete("Session", &session(1), false).unwrap();
    assert!(!plan.dry_run);
    assert_eq!(plan.total_rows(), 1 + 2 + 4);

    assert_eq!(count(&pipeline, "Session"), 1);
    assert_eq!(count(&pipeline, "FilterParams"), 2);
    assert_eq!(count(&pipeline, "FilteredSignal"), 2);
    assert_eq!(count(&pipeline, "Units"), 4);
    for table in ["FilteredSignal", "Units"] {
        assert!(
            rows(&pipeline, table)
                .iter()
                .all(|r| r.key.get("session_id") == Some(&Value::Int(2)))
        );
    }

    let provenance = pipeline.provenance();
    assert!(!provenance.is_populated("FilteredSignal", &signal(1, "low")).unwrap());
    assert!(!provenance.is_populated("Units", &signal(1, "low")).unwrap());
    assert!(provenance.is_populated("Units", &signal(2, "low")).unwrap());
}

#[tokio::test]
async fn descendants_are_deleted_before_their_parents() {
    let store = Arc::new(RecordingStore::new());
    let deletes = store.deletes.clone();
    let pipeline = pipeline_on(store, sorting_tables(), ComputeCatalog::with_builtins());
    seed(&pipeline, &[1]);
    pipeline
        .populator()
        .populate_downstream(None, &PopulateOptions::default())
        .await
        .unwrap();

    let plan = pipeline.cascade().delete("Session", &session(1), false).unwrap();
    let order: Vec<&str> = plan.steps.iter().map(|s| s.table.as_str()).collect();
    assert_eq!(order, vec!["Units", "FilteredSignal", "Session"]);
    assert_eq!(*deletes.lock().unwrap(), vec!["Units", "FilteredSignal", "Session"]);
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let pipeline = populated_sorting_pipeline(&[1, 2]).await;

    let plan = pipeline.cascade().delete("Session", &session(2), true).unwrap();
    assert!(plan.dry_run);
    assert_eq!(plan.total_rows(), 7);
    assert!(plan.conflicts.is_empty());

    assert_eq!(count(&pipeline, "Session"), 2);
    assert_eq!(count(&pipeline, "FilteredSignal"), 4);
    assert_eq!(count(&pipeline, "Units"), 8);
}

#[tokio::test]
async fn running_jobs_block_the_delete() {
    let pipeline = scenario();
    seed(&pipeline, &[1, 2]);
    plant_job(
        &pipeline,
        "FilteredSignal",
        signal(2, "low"),
        vec![
            TableKey::new("Session", session(2)),
            TableKey::new("FilterParams", Key::new().with("filter_name", "low")),
        ],
        now_ms(),
    );

    let err = pipeline.cascade().delete("Session", &session(2), false).unwrap_err();
    assert!(err.is_delete_conflict());
    assert_eq!(count(&pipeline, "Session"), 2);

    let plan = pipeline.cascade().delete("Session", &session(2), true).unwrap();
    assert_eq!(plan.conflicts, vec![TableKey::new("FilteredSignal", signal(2, "low"))]);

    // Rows the job does not read are free to go.
    pipeline.cascade().delete("Session", &session(1), false).unwrap();
    assert_eq!(count(&pipeline, "Session"), 1);

    // A stale reservation does not block.
    pipeline.jobs().clear_job("FilteredSignal", &signal(2, "low")).unwrap();
    plant_job(
        &pipeline,
        "FilteredSignal",
        signal(2, "low"),
        vec![TableKey::new("Session", session(2))],
        1_000,
    );
    pipeline.cascade().delete("Session", &session(2), false).unwrap();
    assert_eq!(count(&pipeline, "Session"), 0);
}

#[tokio::test]
async fn partial_keys_select_every_matching_row() {
    let pipeline = populated_sorting_pipeline(&[1, 2]).await;

    let partial = Key::new().with("filter_name", "high");
    let plan = pipeline.cascade().delete("FilteredSignal", &partial, false).unwrap();
    assert_eq!(plan.total_rows(), 2 + 4);

    assert!(
        rows(&pipeline, "FilteredSignal")
            .iter()
            .all(|r| r.key.get("filter_name") == Some(&Value::text("low")))
    );
    assert_eq!(count(&pipeline, "Units"), 4);
    assert_eq!(count(&pipeline, "FilterParams"), 2);

    let report = pipeline
        .populator()
        .populate("FilteredSignal", &PopulateOptions::default())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 2);
}

#[tokio::test]
async fn deleting_one_fan_out_row_takes_its_row_set() {
    let pipeline = populated_sorting_pipeline(&[1]).await;

    let unit = signal(1, "low").with("unit_id", 0);
    let plan = pipeline.cascade().delete("Units", &unit, false).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].rows.len(), 2);
    assert_eq!(plan.steps[0].commits, vec![signal(1, "low")]);
    assert_eq!(count(&pipeline, "Units"), 2);
    assert_eq!(count(&pipeline, "FilteredSignal"), 2);

    let report = pipeline.populator().populate("Units", &PopulateOptions::default()).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(count(&pipeline, "Units"), 4);
}

#[tokio::test]
async fn manual_children_are_cascaded() {
    let mut tables = scenario_tables();
    tables.push(
        TableDescriptor::manual("Annotation", &["session_id", "note_id"])
            .with_upstream(&["Session"])
            .with_attributes(&["text"]),
    );
    let pipeline = pipeline(tables, ComputeCatalog::with_builtins());
    seed(&pipeline, &[1, 2]);
    let notes = vec![
        Row::new(session(1).with("note_id", 1)).with("text", "noisy channel 12"),
        Row::new(session(2).with("note_id", 1)).with("text", "clean"),
    ];
    pipeline.ingestor().insert_rows("Annotation", notes, false).unwrap();

    let plan = pipeline.cascade().delete("Session", &session(1), false).unwrap();
    let order: Vec<&str> = plan.steps.iter().map(|s| s.table.as_str()).collect();
    assert_eq!(order, vec!["Annotation", "Session"]);
    assert_eq!(count(&pipeline, "Annotation"), 1);
}

#[tokio::test]
async fn malformed_delete_keys_are_rejected() {
    let pipeline = scenario();
    seed(&pipeline, &[1]);

    let err = pipeline.cascade().delete("Session", &Key::new(), false).unwrap_err();
    assert!(matches!(err, EngineError::Pipeline(PipelineError::InvalidKey(_))));

    let err = pipeline
        .cascade()
        .delete("Session", &Key::new().with("subject", "rat1"), false)
        .unwrap_err();
    assert!(matches!(err, EngineError::Pipeline(PipelineError::InvalidRestriction(_))));

    let plan = pipeline.cascade().delete("Session", &session(42), false).unwrap();
    assert!(plan.is_empty());
    assert_eq!(count(&pipeline, "Session"), 1);
}
