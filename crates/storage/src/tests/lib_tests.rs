use super::*;
use shared::domain::Statement;

fn sample_instance(id: &str) -> Instance {
    Instance::new(InstanceId(id.into()), "alice", 3, false, true)
}

#[tokio::test]
async fn create_then_load_round_trips_the_document() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let instance = sample_instance("sprint1");
    assert!(storage.create_instance(&instance).await.expect("create"));

    let loaded = storage
        .load_instance(&instance.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.owner, "alice");
    assert_eq!(loaded.votes_allowed, 3);
    assert_eq!(loaded.votes.get("alice"), Some(&3));
    assert!(loaded.emoji_allowed);
}

#[tokio::test]
async fn create_reports_conflict_without_clobbering() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut first = sample_instance("sprint1");
    first.goods.push(Statement::new("ship faster", "alice"));
    assert!(storage.create_instance(&first).await.expect("create"));

    let second = sample_instance("sprint1");
    assert!(!storage.create_instance(&second).await.expect("create"));

    let loaded = storage
        .load_instance(&first.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.goods.len(), 1);
}

#[tokio::test]
async fn save_replaces_the_whole_document() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut instance = sample_instance("sprint1");
    storage.create_instance(&instance).await.expect("create");

    instance.goods.push(Statement::new("ship faster", "alice"));
    instance.locked = true;
    storage.save_instance(&instance).await.expect("save");

    let loaded = storage
        .load_instance(&instance.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.goods.len(), 1);
    assert!(loaded.locked);
}

#[tokio::test]
async fn save_upserts_when_no_row_exists() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let instance = sample_instance("fresh");
    storage.save_instance(&instance).await.expect("save");
    assert!(storage
        .load_instance(&instance.id)
        .await
        .expect("load")
        .is_some());
}

#[tokio::test]
async fn load_misses_cleanly_for_unknown_id() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let missing = storage
        .load_instance(&InstanceId("nope".into()))
        .await
        .expect("load");
    assert!(missing.is_none());
}

#[tokio::test]
async fn delete_removes_the_row() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let instance = sample_instance("sprint1");
    storage.create_instance(&instance).await.expect("create");
    storage.delete_instance(&instance.id).await.expect("delete");
    assert!(storage
        .load_instance(&instance.id)
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("retro_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage.health_check().await.expect("health check");
    assert!(db_path.exists());

    drop(storage);
    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
