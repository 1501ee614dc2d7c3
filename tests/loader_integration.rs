//! Integration tests for the service description loader.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use supd::engine::ServiceSet;
use supd::load::{LoadError, ServiceLoader};
use supd::service::{ServiceState, ServiceType};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/supd-load-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_service(dir: &PathBuf, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

#[test]
fn test_load_dependency_chain() {
    let dir = unique_test_dir();
    write_service(&dir, "net", "type = internal\n");
    write_service(&dir, "db", "type = internal\ndepends-on = net\n");
    write_service(&dir, "app", "type = internal\ndepends-on = db\n");

    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    let app = loader.load(&mut set, "app").unwrap();

    assert!(set.find_service("net").is_some());
    assert!(set.find_service("db").is_some());

    set.start_service(app, true, false);
    for name in ["net", "db", "app"] {
        let id = set.find_service(name).unwrap();
        assert_eq!(set.service_state(id), Some(ServiceState::Started));
    }
}

#[test]
fn test_load_is_idempotent() {
    let dir = unique_test_dir();
    write_service(&dir, "svc", "type = internal\n");

    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    let first = loader.load(&mut set, "svc").unwrap();
    let second = loader.load(&mut set, "svc").unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_dependency_cycle_rejected() {
    let dir = unique_test_dir();
    write_service(&dir, "a", "type = internal\ndepends-on = b\n");
    write_service(&dir, "b", "type = internal\ndepends-on = a\n");

    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    assert!(matches!(
        loader.load(&mut set, "a"),
        Err(LoadError::DependencyCycle(_))
    ));
}

#[test]
fn test_missing_service_not_found() {
    let dir = unique_test_dir();
    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    assert!(matches!(
        loader.load(&mut set, "ghost"),
        Err(LoadError::NotFound(_))
    ));
}

#[test]
fn test_missing_hard_dependency_fails_load() {
    let dir = unique_test_dir();
    write_service(&dir, "app", "type = internal\ndepends-on = ghost\n");

    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    assert!(matches!(
        loader.load(&mut set, "app"),
        Err(LoadError::NotFound(_))
    ));
}

#[test]
fn test_missing_soft_dependency_is_tolerated() {
    let dir = unique_test_dir();
    write_service(&dir, "app", "type = internal\nwaits-for = ghost\n");

    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    let app = loader.load(&mut set, "app").unwrap();
    set.start_service(app, true, false);
    assert_eq!(set.service_state(app), Some(ServiceState::Started));
}

#[test]
fn test_loaded_process_config() {
    let dir = unique_test_dir();
    write_service(
        &dir,
        "worker",
        "command = /usr/bin/worker --threads 4\nrestart = yes\n",
    );

    let loader = ServiceLoader::new(vec![dir]);
    let mut set = ServiceSet::new();
    let id = loader.load(&mut set, "worker").unwrap();

    let (_, rec) = set.services().find(|(sid, _)| *sid == id).unwrap();
    assert_eq!(rec.kind(), ServiceType::Process);
    assert_eq!(rec.name(), "worker");
}

#[test]
fn test_search_across_directories() {
    let dir_a = unique_test_dir();
    let dir_b = unique_test_dir();
    write_service(&dir_b, "late", "type = internal\n");

    let loader = ServiceLoader::new(vec![dir_a, dir_b]);
    let mut set = ServiceSet::new();
    assert!(loader.load(&mut set, "late").is_ok());
}
