use shared::domain::{Comment, Instance, InstanceId, Statement};
use storage::Storage;

/// A board written through one Storage handle must be readable, intact,
/// through a freshly opened handle over the same file: the restart path the
/// live cache depends on.
#[tokio::test]
async fn documents_survive_a_reopen_of_the_store() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("retro_durability_test_{suffix}"));
    let db_path = temp_root.join("retro.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let mut instance = Instance::new(InstanceId("sprint1".into()), "alice", 3, true, true);
    let mut statement = Statement::new("ship faster", "alice");
    statement.ups.push("bob".into());
    let mut comment = Comment::new("agreed", "bob");
    comment.downs.push("alice".into());
    statement.comments.push(comment);
    instance.goods.push(statement);
    instance.votes.insert("bob".into(), 2);
    instance.users.push("bob".into());

    {
        let storage = Storage::new(&database_url).await.expect("db");
        assert!(storage.create_instance(&instance).await.expect("create"));
        instance.locked = true;
        storage.save_instance(&instance).await.expect("save");
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let loaded = reopened
        .load_instance(&instance.id)
        .await
        .expect("load")
        .expect("present");

    assert!(loaded.locked);
    assert_eq!(loaded.goods[0].ups, vec!["bob".to_string()]);
    assert_eq!(loaded.goods[0].comments[0].downs, vec!["alice".to_string()]);
    assert_eq!(loaded.votes.get("bob"), Some(&2));
    // the stale presence list is persisted as-is; the registry resets it on load
    assert_eq!(loaded.users.len(), 2);

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
