use chatrouter::app::RuntimeConfig;
use chatrouter::config::GatewayConfig;
use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> RuntimeConfig {
    RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn,
        gateway: GatewayConfig::with_gateway_url("http://127.0.0.1:9"),
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("chatrouter.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = chatrouter::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let _state = chatrouter::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
}

#[tokio::test]
async fn sqlite_stores_survive_reopen() {
    use chatrouter::store::{BlobStore, ChatIndex, ChatIndexRow};

    let temp_dir = TempDir::new().expect("temp dir");
    let dsn = format!("sqlite://{}", temp_dir.path().join("chats.db").display());

    let stores = chatrouter::app::Stores::sqlite(&dsn).await.expect("open");
    stores
        .blobs
        .put("chat-1.json", b"{}".to_vec(), "application/json")
        .await
        .expect("blob put");
    stores
        .index
        .insert(ChatIndexRow {
            id: "1".to_string(),
            user_id: "anonymous".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            blob_key: "chat-1.json".to_string(),
            model: "hosted-chat-latest".to_string(),
        })
        .await
        .expect("index insert");
    drop(stores);

    let reopened = chatrouter::app::Stores::sqlite(&dsn).await.expect("reopen");
    assert!(reopened.blobs.get("chat-1.json").await.unwrap().is_some());
    assert_eq!(reopened.index.recent(50).await.unwrap().len(), 1);
}
