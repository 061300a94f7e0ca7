//! Pool admission, eviction, reaping, and restart behavior of the manager.

use std::fs;
use std::path::Path;
use std::time::Duration;

use server::preview::{PreviewConfig, ProjectServerManager};

fn config_for(dir: &Path, range: (u16, u16), max: usize) -> PreviewConfig {
    PreviewConfig {
        max_active_servers: max,
        port_range: range,
        port_map_path: dir.join("ports.json"),
        ..PreviewConfig::default()
    }
}

fn project_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), "payload").unwrap();
    dir
}

fn token_of(url: &str) -> String {
    url.split("token=").nth(1).expect("url carries a token").to_string()
}

fn port_of(url: &str) -> u16 {
    url.trim_start_matches("http://127.0.0.1:")
        .split('/')
        .next()
        .and_then(|port| port.parse().ok())
        .expect("url carries a port")
}

#[tokio::test]
async fn evicts_least_recently_used_when_full() {
    let state = tempfile::tempdir().unwrap();
    let (p1, p2, p3) = (project_dir(), project_dir(), project_dir());

    let manager = ProjectServerManager::new(config_for(state.path(), (43210, 43219), 2));
    manager.register_project_root("p1", p1.path()).await.unwrap();
    manager.register_project_root("p2", p2.path()).await.unwrap();
    manager.register_project_root("p3", p3.path()).await.unwrap();

    let url1 = manager.url_for("p1", "a.txt").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let url2 = manager.url_for("p2", "a.txt").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Touch p1 so p2 becomes the least recently used.
    assert_eq!(reqwest::get(&url1).await.unwrap().status(), 200);
    tokio::time::sleep(Duration::from_millis(10)).await;

    manager.url_for("p3", "a.txt").await.unwrap();

    let stats = manager.stats().await;
    assert_eq!(stats.active_servers, 2);
    let active: Vec<&str> = stats
        .per_project_entries
        .iter()
        .map(|entry| entry.project_id.as_str())
        .collect();
    assert_eq!(active, vec!["p1", "p3"]);

    // The evicted server's old URL no longer connects.
    assert!(reqwest::get(&url2).await.is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn pool_never_exceeds_capacity() {
    let state = tempfile::tempdir().unwrap();
    let dirs: Vec<tempfile::TempDir> = (0..4).map(|_| project_dir()).collect();

    let manager = ProjectServerManager::new(config_for(state.path(), (43220, 43229), 2));
    for (i, dir) in dirs.iter().enumerate() {
        let id = format!("p{i}");
        manager.register_project_root(&id, dir.path()).await.unwrap();
        manager.url_for(&id, "a.txt").await.unwrap();
        assert!(manager.stats().await.active_servers <= 2);
    }
    assert_eq!(manager.stats().await.active_servers, 2);
    assert_eq!(manager.stats().await.max_servers, 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn port_is_stable_across_restart_with_fresh_token() {
    let state = tempfile::tempdir().unwrap();
    let project = project_dir();
    let config = config_for(state.path(), (43230, 43239), 1);

    let (first_port, first_token) = {
        let manager = ProjectServerManager::new(config.clone());
        manager.register_project_root("p1", project.path()).await.unwrap();
        let url = manager.url_for("p1", "a.txt").await.unwrap();
        let parts = (port_of(&url), token_of(&url));
        manager.shutdown().await;
        parts
    };

    let manager = ProjectServerManager::new(config);
    manager.register_project_root("p1", project.path()).await.unwrap();
    let url = manager.url_for("p1", "a.txt").await.unwrap();
    assert_eq!(port_of(&url), first_port);
    assert_ne!(token_of(&url), first_token);

    manager.shutdown().await;
}

#[tokio::test]
async fn stopped_instance_token_is_dead() {
    let state = tempfile::tempdir().unwrap();
    let project = project_dir();

    let manager = ProjectServerManager::new(config_for(state.path(), (43240, 43249), 10));
    manager.register_project_root("p1", project.path()).await.unwrap();
    let old_url = manager.url_for("p1", "a.txt").await.unwrap();
    assert_eq!(reqwest::get(&old_url).await.unwrap().status(), 200);

    manager.stop("p1").await;

    // A fresh instance reuses the port but mints a new token, so the old
    // URL can no longer authenticate.
    let new_url = manager.url_for("p1", "a.txt").await.unwrap();
    assert_eq!(port_of(&new_url), port_of(&old_url));
    assert_ne!(token_of(&new_url), token_of(&old_url));
    assert_eq!(reqwest::get(&old_url).await.unwrap().status(), 401);
    assert_eq!(reqwest::get(&new_url).await.unwrap().status(), 200);

    manager.shutdown().await;
}

#[tokio::test]
async fn stop_all_twice_is_a_noop() {
    let state = tempfile::tempdir().unwrap();
    let project = project_dir();

    let manager = ProjectServerManager::new(config_for(state.path(), (43250, 43259), 10));
    manager.register_project_root("p1", project.path()).await.unwrap();
    manager.url_for("p1", "a.txt").await.unwrap();

    manager.stop_all().await;
    assert_eq!(manager.stats().await.active_servers, 0);
    manager.stop_all().await;
    assert_eq!(manager.stats().await.active_servers, 0);

    // Stopping an absent project is also a no-op.
    manager.stop("p1").await;
    manager.stop("never-started").await;
}

#[tokio::test]
async fn rejects_unknown_projects_and_bad_ids() {
    let state = tempfile::tempdir().unwrap();
    let project = project_dir();

    let manager = ProjectServerManager::new(config_for(state.path(), (43260, 43269), 10));

    let err = manager.url_for("ghost", "a.txt").await.unwrap_err();
    assert_eq!(err.code(), "RootInvalid");

    let err = manager
        .register_project_root("../evil", project.path())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "InvalidProjectId");

    let err = manager
        .register_project_root("p1", project.path().join("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RootInvalid");

    let err = manager
        .register_project_root("p1", project.path().join("a.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RootInvalid");

    manager.shutdown().await;
}

#[tokio::test]
async fn idle_reaper_stops_idle_servers() {
    let state = tempfile::tempdir().unwrap();
    let project = project_dir();

    let config = PreviewConfig {
        idle_timeout: Duration::from_millis(150),
        reaper_interval: Duration::from_millis(100),
        ..config_for(state.path(), (43270, 43279), 10)
    };
    let manager = ProjectServerManager::new(config);
    manager.register_project_root("p1", project.path()).await.unwrap();
    let url = manager.url_for("p1", "a.txt").await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(manager.stats().await.active_servers, 0);
    assert!(reqwest::get(&url).await.is_err());

    // The project comes back on demand with a fresh credential.
    let revived = manager.url_for("p1", "a.txt").await.unwrap();
    assert_ne!(token_of(&revived), token_of(&url));
    assert_eq!(reqwest::get(&revived).await.unwrap().status(), 200);

    manager.shutdown().await;
}

#[tokio::test]
async fn unregister_stops_and_forgets() {
    let state = tempfile::tempdir().unwrap();
    let project = project_dir();

    let manager = ProjectServerManager::new(config_for(state.path(), (43280, 43289), 10));
    manager.register_project_root("p1", project.path()).await.unwrap();
    let url = manager.url_for("p1", "a.txt").await.unwrap();
    assert_eq!(reqwest::get(&url).await.unwrap().status(), 200);

    manager.unregister_project_root("p1").await;
    assert_eq!(manager.stats().await.active_servers, 0);
    assert!(reqwest::get(&url).await.is_err());
    let err = manager.url_for("p1", "a.txt").await.unwrap_err();
    assert_eq!(err.code(), "RootInvalid");

    manager.shutdown().await;
}
