//! End-to-end runs of the commit pipeline over the file-backed store.
//!
//! These cover restart recovery (WAL replay and snapshot load), torn-tail
//! tolerance and compaction.

#![cfg(feature = "persistent")]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use kyrocommit::storage::persistent::{open_store, PersistentConfig, PersistentDurableStore, StoreLock};
use kyrocommit::{
    audit, ChangeListener, CommitConfig, DurableStore, Entity, EntityCache, EntityId, EntityResolver,
    Field, PendingChanges, SiteId, UpdateManager, Value,
};

fn id(local: u64) -> EntityId {
    EntityId::new(SiteId::new(1), local)
}

struct Session {
    cache: Arc<EntityCache>,
    store: Arc<PersistentDurableStore>,
    manager: UpdateManager,
}

fn session(store: PersistentDurableStore) -> Session {
    let pending = Arc::new(PendingChanges::new());
    let cache = Arc::new(EntityCache::new(Arc::clone(&pending) as Arc<dyn ChangeListener>));
    let store = Arc::new(store);
    let manager = UpdateManager::new(
        pending,
        Arc::clone(&cache) as Arc<dyn EntityResolver>,
        Arc::clone(&store) as Arc<dyn DurableStore>,
        CommitConfig {
            commit_interval: Duration::from_millis(5),
            ..CommitConfig::default()
        },
    )
    .unwrap();
    Session { cache, store, manager }
}

fn warm(session: &Session) -> Vec<Entity> {
    let stored = session.store.load_all().unwrap();
    for entity in &stored {
        session.cache.load(entity.clone()).unwrap();
    }
    stored
}

#[test]
fn committed_state_survives_restart() {
    let dir = tempdir().unwrap();
    let owner = Field::new("owner");
    let name = Field::new("name");

    {
        let s = session(open_store(dir.path(), None).unwrap());
        let sword = s.cache.create(id(1)).unwrap();
        let knight = s.cache.create(id(2)).unwrap();
        let squire = s.cache.create(id(3)).unwrap();
        sword.set_field(&name, "excalibur").unwrap();
        sword.set_reference(&owner, Some(knight.id())).unwrap();
        squire.set_reference(&owner, Some(knight.id())).unwrap();
        s.manager.flush().unwrap();

        squire.mark_deleted().unwrap();
        s.manager.enqueue_delete([squire.id()]);
        s.manager.flush().unwrap();
    }

    let s = session(open_store(dir.path(), None).unwrap());
    let stored = warm(&s);
    assert_eq!(stored.len(), 2);
    assert!(audit(&stored).is_empty());

    let sword = s.cache.resolve(id(1)).unwrap();
    assert_eq!(sword.field(&name).unwrap(), Some(Value::from("excalibur")));
    let knight = s.cache.resolve(id(2)).unwrap().snapshot().unwrap();
    assert!(knight.has_back_reference(id(1), &owner));
    assert!(!knight.back_references.contains_key(&id(3)));
}

#[test]
fn store_directory_is_exclusive() {
    let dir = tempdir().unwrap();
    let first = open_store(dir.path(), None).unwrap();
    let holder = StoreLock::recorded_holder(dir.path()).unwrap().unwrap();
    assert_eq!(holder.pid, std::process::id());
    let err = open_store(dir.path(), None).unwrap_err();
    assert!(err.to_string().contains(&holder.to_string()));

    drop(first);
    assert!(StoreLock::recorded_holder(dir.path()).unwrap().is_none());
    open_store(dir.path(), None).unwrap();
}

#[test]
fn torn_wal_tail_keeps_earlier_commits() {
    let dir = tempdir().unwrap();
    {
        let s = session(open_store(dir.path(), None).unwrap());
        for i in 1..=5 {
            s.cache.create(id(i)).unwrap();
        }
        s.manager.flush().unwrap();
    }

    let wal_path = dir.path().join("commit.wal");
    let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    let size = file.metadata().unwrap().len();
    file.set_len(size - 3).unwrap();
    drop(file);

    let store = open_store(dir.path(), None).unwrap();
    let recovered = store.load_all().unwrap().len();
    assert!((1..=4).contains(&recovered), "recovered {recovered} entities");

    // The store keeps accepting writes after dropping the torn entry.
    store.commit_entity(&Entity::new(id(9))).unwrap();
    drop(store);
    let store = open_store(dir.path(), None).unwrap();
    assert!(store.get(id(9)).unwrap().is_some());
}

#[test]
fn compaction_preserves_state() {
    let dir = tempdir().unwrap();
    let config = PersistentConfig {
        max_wal_size: 4 * 1024,
        sync_on_write: false,
    };
    let name = Field::new("name");

    {
        let s = session(open_store(dir.path(), Some(config.clone())).unwrap());
        let handles: Vec<_> = (1..=20).map(|i| s.cache.create(id(i)).unwrap()).collect();
        for round in 0..10_i64 {
            for handle in &handles {
                handle.set_field(&name, round).unwrap();
            }
            s.manager.flush().unwrap();
        }
        assert!(s.store.wal_size() <= 4 * 1024 + 1024);
        let result = s.store.compact().unwrap();
        assert_eq!(result.entities, 20);
    }

    let store = open_store(dir.path(), Some(config)).unwrap();
    let all = store.load_all().unwrap();
    assert_eq!(all.len(), 20);
    assert!(all
        .iter()
        .all(|e| e.fields.get(&name) == Some(&Value::from(9_i64))));
}

#[test]
fn site_delete_is_durable() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path(), None).unwrap();
        store.commit_entity(&Entity::new(EntityId::new(SiteId::new(4), 1))).unwrap();
        store.commit_entity(&Entity::new(EntityId::new(SiteId::new(5), 1))).unwrap();
        store.delete_site(SiteId::new(4)).unwrap();
    }
    let store = open_store(dir.path(), None).unwrap();
    assert!(store.list_site(SiteId::new(4)).unwrap().is_empty());
    assert_eq!(store.list_site(SiteId::new(5)).unwrap().len(), 1);
}
