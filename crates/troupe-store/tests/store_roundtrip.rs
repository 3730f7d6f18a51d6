use chrono::{Duration, Utc};

use troupe_core::traits::{
    ExecutionFilter, ExecutionLogRepo, ExecutionRepo, LogFilter, NewLogEntry, TeamRepo,
};
use troupe_core::types::{
    Execution, ExecutionInput, ExecutionStatus, Team, TeamStatus,
};
use troupe_core::TroupeError;
use troupe_store::SqliteStore;

fn topology() -> troupe_core::topology::TopologyConfig {
    serde_json::from_value(serde_json::json!({
        "nodes": [
            {
                "id": "g", "name": "G", "kind": "GLOBAL_SUPERVISOR",
                "agent_config": {"role": "lead", "instructions": "coordinate",
                                 "provider": "mock", "model_id": "m1"}
            },
            {
                "id": "a1", "name": "A1", "kind": "AGENT",
                "agent_config": {"role": "worker", "instructions": "work",
                                 "provider": "mock", "model_id": "m1"}
            }
        ],
        "edges": [{"source": "g", "target": "a1"}],
        "entry_point": "g"
    }))
    .unwrap()
}

fn team() -> Team {
    Team::new("research-team", topology())
}

fn execution(team: &Team) -> Execution {
    Execution::pending(
        team.id.clone(),
        team.topology.clone(),
        ExecutionInput {
            task: "summarize the incident".into(),
            parameters: Default::default(),
        },
        None,
    )
}

#[tokio::test]
async fn team_crud_round_trip() {
    let store = SqliteStore::in_memory().unwrap();
    let mut team = team();
    TeamRepo::insert(&store, &team).await.unwrap();

    let loaded = TeamRepo::get(&store, &team.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "research-team");
    assert_eq!(loaded.status, TeamStatus::Active);
    assert_eq!(loaded.topology.nodes.len(), 2);

    team.description = "updated".into();
    team.status = TeamStatus::Inactive;
    TeamRepo::update(&store, &team).await.unwrap();
    let loaded = TeamRepo::get(&store, &team.id).await.unwrap().unwrap();
    assert_eq!(loaded.description, "updated");
    assert_eq!(loaded.status, TeamStatus::Inactive);

    let by_name = TeamRepo::get_by_name(&store, "research-team")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_name.id, team.id);

    assert!(TeamRepo::delete(&store, &team.id).await.unwrap());
    assert!(TeamRepo::get(&store, &team.id).await.unwrap().is_none());
    assert!(!TeamRepo::delete(&store, &team.id).await.unwrap());
}

#[tokio::test]
async fn duplicate_team_name_is_conflict() {
    let store = SqliteStore::in_memory().unwrap();
    TeamRepo::insert(&store, &team()).await.unwrap();
    let err = TeamRepo::insert(&store, &team()).await.unwrap_err();
    assert!(matches!(err, TroupeError::Conflict(_)));
}

#[tokio::test]
async fn execution_lifecycle_cas() {
    let store = SqliteStore::in_memory().unwrap();
    let team = team();
    TeamRepo::insert(&store, &team).await.unwrap();

    let exec = execution(&team);
    ExecutionRepo::insert(&store, &exec).await.unwrap();

    let started = Utc::now();
    store.mark_running(&exec.id, started).await.unwrap();
    // A second PENDING → RUNNING attempt must fail.
    assert!(store.mark_running(&exec.id, started).await.is_err());

    let loaded = ExecutionRepo::get(&store, &exec.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Running);
    assert!(store.has_running_for_team(&team.id).await.unwrap());

    let completed = started + Duration::milliseconds(1500);
    let won = store
        .try_finish(&exec.id, ExecutionStatus::Success, completed, None)
        .await
        .unwrap();
    assert!(won);

    // Terminal states are absorbing: the CAS loses the second time.
    let won_again = store
        .try_finish(
            &exec.id,
            ExecutionStatus::Cancelled,
            Utc::now(),
            Some("late cancel".into()),
        )
        .await
        .unwrap();
    assert!(!won_again);

    let loaded = ExecutionRepo::get(&store, &exec.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Success);
    assert_eq!(loaded.duration_ms, Some(1500));
    assert!(loaded.error_message.is_none());
    assert!(!store.has_running_for_team(&team.id).await.unwrap());
}

#[tokio::test]
async fn list_filters_and_pagination() {
    let store = SqliteStore::in_memory().unwrap();
    let team_a = team();
    let mut team_b = team();
    team_b.name = "other-team".into();
    TeamRepo::insert(&store, &team_a).await.unwrap();
    TeamRepo::insert(&store, &team_b).await.unwrap();

    for i in 0..3 {
        let mut exec = execution(&team_a);
        exec.created_at = Utc::now() - Duration::minutes(3 - i);
        ExecutionRepo::insert(&store, &exec).await.unwrap();
    }
    let mut exec_b = execution(&team_b);
    exec_b.status = ExecutionStatus::Failed;
    ExecutionRepo::insert(&store, &exec_b).await.unwrap();

    let all = ExecutionRepo::list(&store, ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    // Newest first.
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let team_a_only = ExecutionRepo::list(
        &store,
        ExecutionFilter {
            team_id: Some(team_a.id.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(team_a_only.len(), 3);

    let failed = ExecutionRepo::list(
        &store,
        ExecutionFilter {
            status: Some(ExecutionStatus::Failed),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(failed.len(), 1);

    let paged = ExecutionRepo::list(
        &store,
        ExecutionFilter {
            limit: 2,
            offset: 2,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(paged.len(), 2);
}

#[tokio::test]
async fn startup_sweep_rewrites_incomplete() {
    let store = SqliteStore::in_memory().unwrap();
    let team = team();
    TeamRepo::insert(&store, &team).await.unwrap();

    let pending = execution(&team);
    ExecutionRepo::insert(&store, &pending).await.unwrap();

    let running = execution(&team);
    ExecutionRepo::insert(&store, &running).await.unwrap();
    store.mark_running(&running.id, Utc::now()).await.unwrap();

    let mut done = execution(&team);
    done.status = ExecutionStatus::Success;
    ExecutionRepo::insert(&store, &done).await.unwrap();

    let swept = store.sweep_incomplete("host restart").await.unwrap();
    assert_eq!(swept, 2);

    for id in [&pending.id, &running.id] {
        let loaded = ExecutionRepo::get(&store, id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("host restart"));
    }
    let loaded = ExecutionRepo::get(&store, &done.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn retention_deletes_old_and_is_idempotent() {
    let store = SqliteStore::in_memory().unwrap();
    let team = team();
    TeamRepo::insert(&store, &team).await.unwrap();

    let mut old = execution(&team);
    old.status = ExecutionStatus::Success;
    old.created_at = Utc::now() - Duration::days(45);
    ExecutionRepo::insert(&store, &old).await.unwrap();
    store
        .append(&NewLogEntry {
            execution_id: old.id.clone(),
            sequence: 1,
            timestamp: old.created_at,
            event_type: "execution_started".into(),
            node_id: None,
            agent_id: None,
            supervisor_id: None,
            message: "started".into(),
            extra_data: None,
        })
        .await
        .unwrap();

    let mut fresh = execution(&team);
    fresh.status = ExecutionStatus::Success;
    ExecutionRepo::insert(&store, &fresh).await.unwrap();

    let cutoff = Utc::now() - Duration::days(30);
    assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 1);
    // Second pass over unchanged data is a no-op.
    assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 0);

    assert!(ExecutionRepo::get(&store, &old.id).await.unwrap().is_none());
    assert!(ExecutionRepo::get(&store, &fresh.id).await.unwrap().is_some());
    assert_eq!(store.last_sequence(&old.id).await.unwrap(), 0);
}

#[tokio::test]
async fn log_append_query_and_range() {
    let store = SqliteStore::in_memory().unwrap();
    let team = team();
    let exec = execution(&team);
    ExecutionRepo::insert(&store, &exec).await.unwrap();

    for (seq, event_type, node_id) in [
        (1u64, "execution_started", None),
        (2, "node_entered", Some("a1")),
        (3, "node_completed", Some("a1")),
        (4, "execution_completed", None),
    ] {
        store
            .append(&NewLogEntry {
                execution_id: exec.id.clone(),
                sequence: seq,
                timestamp: Utc::now(),
                event_type: event_type.into(),
                node_id: node_id.map(String::from),
                agent_id: None,
                supervisor_id: None,
                message: format!("event {seq}"),
                extra_data: Some(serde_json::json!({"seq": seq})),
            })
            .await
            .unwrap();
    }

    assert_eq!(store.last_sequence(&exec.id).await.unwrap(), 4);

    // Duplicate sequence violates the per-execution uniqueness contract.
    let dup = store
        .append(&NewLogEntry {
            execution_id: exec.id.clone(),
            sequence: 4,
            timestamp: Utc::now(),
            event_type: "node_failed".into(),
            node_id: None,
            agent_id: None,
            supervisor_id: None,
            message: "dup".into(),
            extra_data: None,
        })
        .await;
    assert!(matches!(dup, Err(TroupeError::Conflict(_))));

    let mid = store.range(&exec.id, 1, 4).await.unwrap();
    assert_eq!(
        mid.iter().map(|l| l.sequence).collect::<Vec<_>>(),
        vec![2, 3]
    );

    let node_events = store
        .query(
            &exec.id,
            LogFilter {
                node_id: Some("a1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(node_events.len(), 2);

    let since = store
        .query(
            &exec.id,
            LogFilter {
                since_sequence: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        since.iter().map(|l| l.sequence).collect::<Vec<_>>(),
        vec![3, 4]
    );

    let typed = store
        .query(
            &exec.id,
            LogFilter {
                event_type: Some("execution_completed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(typed.len(), 1);
    assert_eq!(typed[0].extra_data.as_ref().unwrap()["seq"], 4);
}
