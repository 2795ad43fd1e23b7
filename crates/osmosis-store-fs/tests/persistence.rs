use osmosis_common::{BinaryPath, Id, JsonValue};
use osmosis_store::save_state::SaveState;
use osmosis_store::{
    parse_jsonpath, Action, JsonSource, Op, PathRef, ScalarAction,
};
use osmosis_store_fs::{FsSaveState, METADATA_FILE, RECENT_FILE};
use uuid::Uuid;

fn author(byte: u8) -> Uuid {
    Uuid::from_bytes([byte; 16])
}

fn set_op(author_byte: u8, index: u64, key: &str, value: i32) -> Op {
    Op {
        id: Id::new(author(author_byte), index),
        action: Action::Scalar(ScalarAction::Set {
            path: PathRef::Compiled(parse_jsonpath(&format!("$.{key}")).unwrap()),
            value: value.into(),
        }),
    }
}

fn doc(state: &FsSaveState) -> serde_json::Value {
    state
        .source()
        .materialize(&BinaryPath::ROOT)
        .unwrap()
        .into()
}

fn save_point_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("savepoint-"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn fresh_directory_is_seeded() {
    let dir = tempfile::tempdir().unwrap();
    let state = FsSaveState::open(dir.path()).await.unwrap();
    state.flush().await;
    // Base save-point plus the empty recent file.
    assert_eq!(save_point_files(dir.path()).len(), 1);
    assert!(dir.path().join(RECENT_FILE).exists());
    assert!(!dir.path().join(METADATA_FILE).exists());
}

#[tokio::test]
async fn reopen_restores_state_and_hash() {
    let dir = tempfile::tempdir().unwrap();
    let summary = {
        let mut state = FsSaveState::open(dir.path()).await.unwrap();
        for i in 1..=10 {
            state.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        state.flush().await;
        state.state_summary()
    };

    let state = FsSaveState::open(dir.path()).await.unwrap();
    assert_eq!(state.state_summary(), summary);
    assert_eq!(doc(&state)["k"], serde_json::json!(10.0));
    assert_eq!(state.ops_range(None, None).len(), 10);
    // The ladder after 10 ops: ZERO, 4, 8.
    let ids: Vec<u64> = state.save_points().iter().map(|sp| sp.id.index).collect();
    assert_eq!(ids, vec![0, 4, 8]);
}

#[tokio::test]
async fn compaction_deletes_merged_save_point_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = FsSaveState::open(dir.path()).await.unwrap();
    for i in 1..=12 {
        state.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
    }
    state.flush().await;
    // Ladder is [ZERO(w8), 8, 12]: the rung at index 4 was merged away and
    // its file must be gone.
    assert_eq!(state.save_points().len(), 3);
    assert_eq!(save_point_files(dir.path()).len(), 3);

    let reopened = FsSaveState::open(dir.path()).await.unwrap();
    assert_eq!(reopened.state_summary(), state.state_summary());
    assert_eq!(doc(&reopened), doc(&state));
}

#[tokio::test]
async fn metadata_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut state = FsSaveState::open(dir.path()).await.unwrap();
        let created = state
            .init_metadata(&mut || {
                serde_json::json!({"peer_id": author(9).to_string()}).into()
            })
            .unwrap()
            .clone();
        // A second init must not overwrite.
        let again = state
            .init_metadata(&mut || JsonValue::String("other".into()))
            .unwrap()
            .clone();
        assert_eq!(created, again);
        state.flush().await;
    }
    let state = FsSaveState::open(dir.path()).await.unwrap();
    let metadata = state.metadata().unwrap();
    let peer = metadata.as_map().unwrap().get("peer_id").unwrap();
    assert_eq!(peer, &JsonValue::String(author(9).to_string()));
}

#[tokio::test]
async fn rewind_and_replay_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let full = {
        let mut state = FsSaveState::open(dir.path()).await.unwrap();
        for i in 1..=9 {
            state.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        let summary = state.state_summary();
        let dropped = state.rewind(Id::new(author(1), 6)).unwrap();
        assert_eq!(dropped.len(), 3);
        state.insert(dropped).unwrap();
        assert_eq!(state.state_summary(), summary);
        state.flush().await;
        summary
    };
    let state = FsSaveState::open(dir.path()).await.unwrap();
    assert_eq!(state.state_summary(), full);
}

#[tokio::test]
async fn garbage_collect_trims_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = FsSaveState::open(dir.path()).await.unwrap();
    for i in 1..=12 {
        state.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
    }
    state.garbage_collect(Id::new(author(1), 8)).unwrap();
    state.flush().await;
    assert!(state.save_points()[0].id.index >= 8);
    assert_eq!(
        save_point_files(dir.path()).len(),
        state.save_points().len()
    );

    let mut reopened = FsSaveState::open(dir.path()).await.unwrap();
    assert_eq!(reopened.state_summary(), state.state_summary());
    assert_eq!(doc(&reopened)["k"], serde_json::json!(12.0));
    assert!(reopened.rewind(Id::new(author(1), 2)).is_err());
}
