mod common;

use common::{count_rows, create_table, open_local, query_column, version_dirs, wait_until};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_reader_keeps_its_version_across_replace() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;

    create_table(&db, "t", "SELECT 1 AS id, 'India' AS country").await;
    let old = db.acquire_read_connection().await.expect("old reader");

    create_table(&db, "t", "SELECT 2 AS id, 'USA' AS country").await;
    let pinned: String = old
        .query_row("SELECT country FROM t", [], |row| row.get(0))
        .expect("old snapshot query");
    assert_eq!(pinned, "India");
    assert_eq!(
        query_column(&db, "SELECT country FROM t").await,
        Ok(vec!["USA".to_string()])
    );
    assert_eq!(version_dirs(dir.path(), "t").len(), 2);

    let reclaimed = db.stats().versions_reclaimed;
    old.release().expect("release");
    wait_until("old version reclaimed", || {
        version_dirs(dir.path(), "t").len() == 1
    })
    .await;
    wait_until("reclaim counted", || db.stats().versions_reclaimed > reclaimed).await;
    assert_eq!(
        query_column(&db, "SELECT country FROM t").await,
        Ok(vec!["USA".to_string()])
    );
    db.close().await.expect("close");
}

#[tokio::test]
async fn test_dropped_table_stays_readable_until_released() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;

    create_table(&db, "t", "SELECT 7 AS id").await;
    let reader = db.acquire_read_connection().await.expect("reader");
    db.drop_table("t").await.expect("drop");

    let id: i32 = reader
        .query_row("SELECT id FROM t", [], |row| row.get(0))
        .expect("pinned read");
    assert_eq!(id, 7);
    assert!(query_column(&db, "SELECT id::VARCHAR FROM t").await.is_err());
    assert!(dir.path().join("t").exists());

    drop(reader);
    wait_until("dropped table removed", || !dir.path().join("t").exists()).await;
    db.close().await.expect("close");
}

#[tokio::test]
async fn test_readers_share_one_generation_until_a_write() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;
    create_table(&db, "t", "SELECT 1 AS id").await;

    let a = db.acquire_read_connection().await.expect("a");
    let b = db.acquire_read_connection().await.expect("b");
    assert_eq!(a.generation(), b.generation());
    assert_eq!(db.stats().generation_attaches, 1);
    drop(a);
    drop(b);

    let c = db.acquire_read_connection().await.expect("c");
    assert_eq!(db.stats().generation_attaches, 1);
    let first_generation = c.generation();
    drop(c);

    create_table(&db, "u", "SELECT 2 AS id").await;
    let d = db.acquire_read_connection().await.expect("d");
    assert!(d.generation() > first_generation);
    assert_eq!(db.stats().generation_attaches, 2);
    assert_eq!(d.tables().len(), 2);
    drop(d);

    wait_until("old generation reclaimed", || {
        db.stats().snapshots_reclaimed >= 1
    })
    .await;
    assert_eq!(db.stats().live_snapshots, 1);
    db.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_are_serialized() {
    let dir = tempdir().expect("temp dir");
    let db = Arc::new(open_local(dir.path()).await);
    create_table(&db, "t", "SELECT 0 AS id").await;

    let mut handles = Vec::new();
    for i in 1..=8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.mutate_table("t", &[], move |conn| {
                conn.execute("INSERT INTO t VALUES (?)", [i])?;
                Ok(())
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("mutate");
    }

    assert_eq!(count_rows(&db, "t").await, 9);
    wait_until("superseded versions reclaimed", || {
        version_dirs(dir.path(), "t").len() == 1
    })
    .await;
    db.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_write_holds_the_lock_until_its_work_ends() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;
    create_table(&db, "slow", "SELECT 1 AS id").await;
    create_table(&db, "other", "SELECT 1 AS id").await;
    let before = db.table("slow").expect("meta");

    let busy = Arc::new(AtomicBool::new(false));
    let flag = busy.clone();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(300),
        db.mutate_table("slow", &[], move |conn| {
            flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1500));
            conn.execute_batch("INSERT INTO slow VALUES (2)")?;
            flag.store(false, Ordering::SeqCst);
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err(), "slow write should time out");

    let overlapped = Arc::new(AtomicBool::new(false));
    let seen = overlapped.clone();
    let flag = busy.clone();
    db.mutate_table("other", &[], move |conn| {
        seen.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
        conn.execute_batch("INSERT INTO other VALUES (2)")?;
        Ok(())
    })
    .await
    .expect("second write");
    assert!(!overlapped.load(Ordering::SeqCst), "two writes ran at once");
    assert_eq!(count_rows(&db, "other").await, 2);

    // the cancelled write never published and its version is cleaned up
    assert_eq!(db.table("slow").expect("meta"), before);
    assert_eq!(count_rows(&db, "slow").await, 1);
    wait_until("cancelled version removed", || {
        version_dirs(dir.path(), "slow").len() == 1
    })
    .await;
    db.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_partial_writes() {
    let dir = tempdir().expect("temp dir");
    let db = Arc::new(open_local(dir.path()).await);
    create_table(&db, "t", "SELECT 1 AS a, 1 AS b").await;

    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            for n in 2..=10 {
                let query = format!("SELECT {n} AS a, {n} AS b");
                db.create_table_as_select("t", &query, Default::default())
                    .await
                    .expect("replace");
            }
        })
    };
    for _ in 0..20 {
        let conn = db.acquire_read_connection().await.expect("reader");
        let (a, b): (i32, i32) = conn
            .query_row("SELECT a, b FROM t", [], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("read");
        assert_eq!(a, b);
    }
    writer.await.expect("writer");
    assert_eq!(
        query_column(&db, "SELECT a::VARCHAR FROM t").await,
        Ok(vec!["10".to_string()])
    );
    db.close().await.expect("close");
}
