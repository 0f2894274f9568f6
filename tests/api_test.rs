use procmind_monitor::api::{router, ApiState};
use procmind_monitor::registry::RegistryStore;
use procmind_monitor::types::RemoteAccessConfig;
use std::net::SocketAddr;

async fn spawn_server(registry_path: std::path::PathBuf, allow_remote: bool) -> SocketAddr {
    let log_dir = registry_path.parent().unwrap().join("logs");
    let instance_id = "test-instance".to_string();

    if allow_remote {
        let mut store = RegistryStore::new(&registry_path, instance_id.clone());
        store.load().unwrap();
        store
            .with_lock("enable-remote", |registry| {
                registry.remote_access = RemoteAccessConfig {
                    enabled: true,
                    trusted_hosts: vec!["127.0.0.1".to_string()],
                    allow_register: true,
                    ..RemoteAccessConfig::default()
                };
            })
            .unwrap();
    }

    let state = ApiState::new(registry_path, log_dir, instance_id);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    addr
}

#[tokio::test]
async fn monitor_status_reports_empty_registry() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("registry.json");
    let addr = spawn_server(registry_path, false).await;

    let resp = reqwest::get(format!("http://{addr}/monitor/status")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn register_without_remote_access_enabled_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("registry.json");
    let addr = spawn_server(registry_path, false).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/processes"))
        .json(&serde_json::json!({
            "id": "svc-a",
            "name": "svc-a",
            "command": "/bin/true",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn register_with_remote_access_enabled_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("registry.json");
    let addr = spawn_server(registry_path, true).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/processes"))
        .json(&serde_json::json!({
            "id": "svc-a",
            "name": "svc-a",
            "command": "/bin/true",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 201);

    let list = client
        .get(format!("http://{addr}/processes"))
        .send()
        .await
        .unwrap()
        .json::<Vec<serde_json::Value>>()
        .await
        .unwrap();
    assert_eq!(list.len(), 1);
}

#[tokio::test]
async fn get_unknown_process_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("registry.json");
    let addr = spawn_server(registry_path, false).await;

    let resp = reqwest::get(format!("http://{addr}/processes/does-not-exist")).await.unwrap();
    assert_eq!(resp.status(), 404);
}
