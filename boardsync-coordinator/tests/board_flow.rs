//! End-to-end WebSocket tests for the board coordinator: connection
//! handshake, snapshot delivery, mutation broadcasts, conflict
//! notification, offline replay, and write-behind durability.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use boardsync_coordinator::lock::LOCK_TTL;
use boardsync_coordinator::server::{self, BoardState};
use boardsync_coordinator::storage::{MemoryTaskStore, TaskStore};
use boardsync_proto::codec;
use boardsync_proto::event::{
    ClientEvent, CreateTask, DeleteTask, Hello, MoveTask, QueuedOp, ServerEvent, UpdateTask,
};
use boardsync_proto::task::{ColumnId, Task, TaskId};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Starts a coordinator on an OS-assigned port with a short flush delay.
async fn start_test_server() -> (std::net::SocketAddr, Arc<BoardState>, Arc<MemoryTaskStore>) {
    start_test_server_with_store(Arc::new(MemoryTaskStore::new())).await
}

async fn start_test_server_with_store(
    store: Arc<MemoryTaskStore>,
) -> (std::net::SocketAddr, Arc<BoardState>, Arc<MemoryTaskStore>) {
    let state = Arc::new(BoardState::with_flush_delay(
        store.clone() as Arc<dyn TaskStore>,
        Duration::from_millis(50),
    ));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", state.clone(), "*")
        .await
        .expect("failed to start test server");
    (addr, state, store)
}

/// Connects a client, performs the handshake, and returns the socket plus
/// the private board snapshot.
async fn connect(addr: std::net::SocketAddr, name: &str) -> (WsStream, Vec<Task>, usize) {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws_send(
        &mut ws,
        &ClientEvent::Hello(Hello {
            display_name: name.to_string(),
        }),
    )
    .await;

    match ws_recv(&mut ws).await {
        ServerEvent::BoardSnapshot { tasks, presence } => (ws, tasks, presence.len()),
        other => panic!("expected BoardSnapshot, got {other:?}"),
    }
}

async fn ws_send(ws: &mut WsStream, event: &ClientEvent) {
    let bytes = codec::encode_client(event).unwrap();
    ws.send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();
}

async fn ws_recv(ws: &mut WsStream) -> ServerEvent {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed")
        .unwrap();
    codec::decode_server(&msg.into_data()).unwrap()
}

fn create_payload(title: &str, column: ColumnId) -> CreateTask {
    CreateTask {
        id: TaskId::new(),
        column,
        title: title.to_string(),
        description: None,
        creator_name: None,
        creator_color: None,
    }
}

#[tokio::test]
async fn snapshot_on_connect_and_presence_fanout() {
    let (addr, _state, _store) = start_test_server().await;

    let (mut ws_alice, tasks, presence_count) = connect(addr, "Alice").await;
    assert!(tasks.is_empty());
    assert_eq!(presence_count, 1);

    let (_ws_bob, _tasks, bob_presence_count) = connect(addr, "Bob").await;
    assert_eq!(bob_presence_count, 2);

    // Alice learns about Bob via a broadcast she did not trigger.
    match ws_recv(&mut ws_alice).await {
        ServerEvent::PresenceState(presence) => {
            assert_eq!(presence.len(), 2);
            let names: Vec<&str> = presence.iter().map(|p| p.display_name.as_str()).collect();
            assert!(names.contains(&"Alice"));
            assert!(names.contains(&"Bob"));
        }
        other => panic!("expected PresenceState, got {other:?}"),
    }
}

#[tokio::test]
async fn create_on_empty_board_broadcasts_to_everyone() {
    let (addr, _state, _store) = start_test_server().await;
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;
    let (mut ws_bob, _, _) = connect(addr, "Bob").await;
    let _roster = ws_recv(&mut ws_alice).await; // Bob's arrival

    ws_send(
        &mut ws_bob,
        &ClientEvent::TaskCreate(create_payload("A", ColumnId::Todo)),
    )
    .await;

    for ws in [&mut ws_alice, &mut ws_bob] {
        match ws_recv(ws).await {
            ServerEvent::TaskCreated(task) => {
                assert_eq!(task.title, "A");
                assert_eq!(task.column, ColumnId::Todo);
                assert_eq!(task.order, 0.5);
                assert_eq!(task.version, 1);
                assert_eq!(task.creator_name, "Bob");
            }
            other => panic!("expected TaskCreated, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn move_conflict_notifies_loser_with_authoritative_state() {
    let (addr, state, store) = start_test_server().await;
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;

    let payload = create_payload("Contested", ColumnId::Todo);
    let task_id = payload.id.clone();
    ws_send(&mut ws_alice, &ClientEvent::TaskCreate(payload)).await;
    let _created = ws_recv(&mut ws_alice).await;

    // Another participant's move is mid-flight: it holds the lock.
    state.locks.acquire(&task_id, "rival-conn", LOCK_TTL).await;

    ws_send(
        &mut ws_alice,
        &ClientEvent::TaskMove(MoveTask {
            id: task_id.clone(),
            column: ColumnId::Done,
            order: 0.5,
            version: 1,
        }),
    )
    .await;

    match ws_recv(&mut ws_alice).await {
        ServerEvent::ConflictNotify {
            task_id: contested,
            resolved_state,
            message,
        } => {
            assert_eq!(contested, task_id);
            assert_eq!(resolved_state.column, ColumnId::Todo);
            assert_eq!(resolved_state.version, 1);
            assert!(!message.is_empty());
        }
        other => panic!("expected ConflictNotify, got {other:?}"),
    }

    // Exactly one audit row, written off the critical path.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let audits = store.audit_rows().await;
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].winner_user_id, "rival-conn");
    assert_eq!(audits[0].resolved_state.version, 1);
}

#[tokio::test]
async fn concurrent_move_and_edit_both_apply() {
    let (addr, state, _store) = start_test_server().await;
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;
    let (mut ws_bob, _, _) = connect(addr, "Bob").await;
    let _roster = ws_recv(&mut ws_alice).await;

    let payload = create_payload("A", ColumnId::Todo);
    let task_id = payload.id.clone();
    ws_send(&mut ws_alice, &ClientEvent::TaskCreate(payload)).await;
    let _ = ws_recv(&mut ws_alice).await;
    let _ = ws_recv(&mut ws_bob).await;

    // Fire both mutations without waiting: they interleave on the server.
    ws_send(
        &mut ws_alice,
        &ClientEvent::TaskMove(MoveTask {
            id: task_id.clone(),
            column: ColumnId::Done,
            order: 0.5,
            version: 1,
        }),
    )
    .await;
    ws_send(
        &mut ws_bob,
        &ClientEvent::TaskUpdate(UpdateTask {
            id: task_id.clone(),
            title: Some("A, revised".to_string()),
            description: None,
            version: 1,
        }),
    )
    .await;

    // Each client sees both broadcasts, in either order, and no conflict.
    for ws in [&mut ws_alice, &mut ws_bob] {
        let first = ws_recv(ws).await;
        let second = ws_recv(ws).await;
        for event in [&first, &second] {
            assert!(
                matches!(event, ServerEvent::TaskMoved(_) | ServerEvent::TaskUpdated(_)),
                "unexpected event: {event:?}"
            );
        }
    }

    let merged = state.cache.get(&task_id).await.unwrap().unwrap();
    assert_eq!(merged.column, ColumnId::Done);
    assert_eq!(merged.title, "A, revised");
    assert_eq!(merged.version, 3);
}

#[tokio::test]
async fn delete_broadcasts_id_only_and_is_idempotent() {
    let (addr, _state, _store) = start_test_server().await;
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;

    let payload = create_payload("Doomed", ColumnId::Todo);
    let task_id = payload.id.clone();
    ws_send(&mut ws_alice, &ClientEvent::TaskCreate(payload)).await;
    let _ = ws_recv(&mut ws_alice).await;

    for _ in 0..2 {
        ws_send(
            &mut ws_alice,
            &ClientEvent::TaskDelete(DeleteTask {
                id: task_id.clone(),
            }),
        )
        .await;
        match ws_recv(&mut ws_alice).await {
            ServerEvent::TaskDeleted { id } => assert_eq!(id, task_id),
            other => panic!("expected TaskDeleted, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn replay_applies_in_client_timestamp_order() {
    let (addr, _state, _store) = start_test_server().await;
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;

    let create = create_payload("Offline", ColumnId::Todo);
    let task_id = create.id.clone();
    // Buffered offline in one order, sent in another; timestamps decide.
    let ops = vec![
        QueuedOp {
            op: ClientEvent::TaskMove(MoveTask {
                id: task_id.clone(),
                column: ColumnId::InProgress,
                order: 0.5,
                version: 1,
            }),
            client_timestamp: 20,
        },
        QueuedOp {
            op: ClientEvent::TaskCreate(create),
            client_timestamp: 10,
        },
        QueuedOp {
            op: ClientEvent::TaskUpdate(UpdateTask {
                id: task_id.clone(),
                title: Some("Offline, revised".to_string()),
                description: None,
                version: 2,
            }),
            client_timestamp: 30,
        },
    ];
    ws_send(&mut ws_alice, &ClientEvent::ReplayOps(ops)).await;

    assert!(matches!(
        ws_recv(&mut ws_alice).await,
        ServerEvent::TaskCreated(_)
    ));
    assert!(matches!(
        ws_recv(&mut ws_alice).await,
        ServerEvent::TaskMoved(_)
    ));
    match ws_recv(&mut ws_alice).await {
        ServerEvent::TaskUpdated(task) => {
            assert_eq!(task.column, ColumnId::InProgress);
            assert_eq!(task.title, "Offline, revised");
            assert_eq!(task.version, 3);
        }
        other => panic!("expected TaskUpdated, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_removes_presence_and_notifies_others() {
    let (addr, _state, _store) = start_test_server().await;
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;
    let (mut ws_bob, _, _) = connect(addr, "Bob").await;
    let _roster = ws_recv(&mut ws_alice).await;

    ws_bob.close(None).await.unwrap();

    match ws_recv(&mut ws_alice).await {
        ServerEvent::PresenceState(presence) => {
            assert_eq!(presence.len(), 1);
            assert_eq!(presence[0].display_name, "Alice");
        }
        other => panic!("expected PresenceState, got {other:?}"),
    }
}

#[tokio::test]
async fn cold_start_serves_snapshot_from_durable_storage() {
    let seeded = vec![
        Task {
            id: TaskId::new(),
            column: ColumnId::Done,
            title: "Restored B".to_string(),
            description: String::new(),
            order: 0.5,
            version: 3,
            created_at: 1000,
            updated_at: 2000,
            creator_name: "old-alice".into(),
            creator_color: "#e06c75".into(),
            updated_by_name: "old-alice".into(),
            updated_by_color: "#e06c75".into(),
        },
        Task {
            id: TaskId::new(),
            column: ColumnId::Todo,
            title: "Restored A".to_string(),
            description: String::new(),
            order: 0.5,
            version: 1,
            created_at: 1000,
            updated_at: 1000,
            creator_name: "old-bob".into(),
            creator_color: "#61afef".into(),
            updated_by_name: "old-bob".into(),
            updated_by_color: "#61afef".into(),
        },
    ];
    let store = Arc::new(MemoryTaskStore::seeded(seeded));
    let (addr, _state, _store) = start_test_server_with_store(store).await;

    let (_ws, tasks, _) = connect(addr, "Alice").await;
    let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
    // Hydrated from storage and sorted by (column, order).
    assert_eq!(titles, ["Restored A", "Restored B"]);
}

#[tokio::test]
async fn drag_burst_reaches_storage_as_one_write() {
    // A longer debounce than the shared helper's, so the whole burst of
    // round-trips lands inside one window even on a slow machine.
    let store = Arc::new(MemoryTaskStore::new());
    let state = Arc::new(BoardState::with_flush_delay(
        store.clone() as Arc<dyn TaskStore>,
        Duration::from_millis(400),
    ));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", state.clone(), "*")
        .await
        .expect("failed to start test server");
    let (mut ws_alice, _, _) = connect(addr, "Alice").await;

    let payload = create_payload("Dragged", ColumnId::Todo);
    let task_id = payload.id.clone();
    ws_send(&mut ws_alice, &ClientEvent::TaskCreate(payload)).await;
    let _ = ws_recv(&mut ws_alice).await;

    // A drag burst: many moves in quick succession.
    for i in 1..=10u64 {
        ws_send(
            &mut ws_alice,
            &ClientEvent::TaskMove(MoveTask {
                id: task_id.clone(),
                column: ColumnId::Todo,
                order: 0.5 + i as f64,
                version: i,
            }),
        )
        .await;
        let _moved = ws_recv(&mut ws_alice).await;
    }

    // Let the debounce window close and the flush land.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(store.upsert_count(), 1, "burst must coalesce to one write");

    let stored = store.fetch(&task_id).await.unwrap().unwrap();
    let live = state.cache.get(&task_id).await.unwrap().unwrap();
    assert_eq!(stored, live);
    assert_eq!(stored.order, 10.5);
}
