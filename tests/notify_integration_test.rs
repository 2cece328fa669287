//! Integration tests against the real notify backend.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use watchhub::config::WatcherConfig;
use watchhub::{
    BackoffPolicy, Bus, BusOptions, Event, EventHub, EventType, NotifyPrimitive, Op,
    RecursiveRegistrar, SupervisorState, WatchSupervisor,
};

const DEADLINE: Duration = Duration::from_secs(5);

/// Wait for an event on `path` whose operations intersect `op`.
fn wait_for_event(rx: &Receiver<Event>, path: &Path, op: Op) -> Option<Event> {
    let started = Instant::now();
    while started.elapsed() < DEADLINE {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) if event.path == path && event.op.intersects(op) => return Some(event),
            _ => {}
        }
    }
    None
}

async fn wait_for_state(supervisor: &WatchSupervisor, state: SupervisorState) -> bool {
    let started = Instant::now();
    while started.elapsed() < DEADLINE {
        if supervisor.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn hub() -> EventHub {
    EventHub::new(
        &CancellationToken::new(),
        Arc::new(NotifyPrimitive::new()),
        BusOptions::named("hub"),
    )
}

#[test]
fn test_registrar_reports_changes_in_subdirectories() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("src/watcher")).unwrap();

    let registrar = RecursiveRegistrar::new(
        Arc::new(NotifyPrimitive::new()),
        Bus::new(&CancellationToken::new(), BusOptions::named("registrar")),
        &WatcherConfig::default(),
    );
    let (rx, _cancel) = registrar.subscribe();

    let added = registrar.add_recursive_watches(root.path()).unwrap();
    assert_eq!(added.len(), 2);

    let file = root.path().join("src/watcher/hub.rs");
    fs::write(&file, "pub struct Hub;").unwrap();

    let event = wait_for_event(&rx, &file, Op::CREATE | Op::WRITE).expect("no event for new file");
    assert_eq!(event.ty, EventType::FileChanged);

    registrar.close();
    assert_eq!(registrar.active_watches(), 0);
}

#[test]
fn test_hub_publishes_file_writes() {
    let dir = TempDir::new().unwrap();
    let plan = dir.path().join("plan.md");
    fs::write(&plan, "# plan").unwrap();

    let hub = hub();
    let (_id, rx) = hub.subscribe_all();
    hub.watch_file(&plan).unwrap();
    hub.watch_file(&plan).unwrap();

    fs::write(&plan, "# plan\n- step").unwrap();

    let event = wait_for_event(&rx, &plan, Op::WRITE).expect("no write event");
    assert_eq!(event.ty, EventType::FileChanged);

    hub.close();
}

#[test]
fn test_hub_rejects_missing_file() {
    let dir = TempDir::new().unwrap();
    let hub = hub();

    assert!(hub.watch_file(&dir.path().join("missing.md")).is_err());
    assert!(hub.watched_paths().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_supervisor_survives_delete_and_recreate() {
    let dir = TempDir::new().unwrap();
    let plan = dir.path().join("plan.md");
    fs::write(&plan, "v1").unwrap();

    let hub = hub();
    let supervisor = WatchSupervisor::new(
        hub.clone(),
        &plan,
        BackoffPolicy::doubling(Duration::from_millis(10), Duration::from_millis(100)),
    )
    .unwrap();
    supervisor.start();
    assert_eq!(supervisor.state(), SupervisorState::Watching);

    fs::remove_file(&plan).unwrap();
    assert!(wait_for_state(&supervisor, SupervisorState::Retrying).await);

    fs::write(&plan, "v2").unwrap();
    assert!(wait_for_state(&supervisor, SupervisorState::Watching).await);
    assert!(hub.is_watching(&plan));

    supervisor.shutdown();
    hub.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_supervisor_follows_atomic_save() {
    let dir = TempDir::new().unwrap();
    let plan = dir.path().join("plan.md");
    fs::write(&plan, "v1").unwrap();

    let hub = hub();
    let (_id, rx) = hub.subscribe_all();
    let supervisor = WatchSupervisor::new(
        hub.clone(),
        &plan,
        BackoffPolicy::doubling(Duration::from_millis(10), Duration::from_millis(100)),
    )
    .unwrap();
    supervisor.start();

    // Editor-style save: write a sibling and rename it over the original.
    let tmp = dir.path().join(".plan.md.tmp");
    fs::write(&tmp, "v2").unwrap();
    fs::rename(&tmp, &plan).unwrap();

    // Keep writing until the re-established watch reports it.
    let started = Instant::now();
    let mut seen = false;
    while started.elapsed() < DEADLINE && !seen {
        fs::write(&plan, format!("v{}", started.elapsed().as_millis())).unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);
        while let Ok(event) = rx.recv_deadline(deadline) {
            if event.path == plan
                && event.op.contains(Op::WRITE)
                && supervisor.state() == SupervisorState::Watching
            {
                seen = true;
                break;
            }
        }
        tokio::task::yield_now().await;
    }
    assert!(seen, "no write observed after atomic save");

    supervisor.shutdown();
    hub.close();
}
