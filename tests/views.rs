mod common;

use common::{create_table, create_view, open_local, query_column};
use tempfile::tempdir;

#[tokio::test]
async fn test_view_created_before_its_source() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;

    create_view(&db, "early", "SELECT country FROM late").await;
    let err = query_column(&db, "SELECT * FROM early")
        .await
        .expect_err("source missing");
    assert!(err.contains("early"), "{err}");

    create_table(&db, "late", "SELECT 'India' AS country").await;
    assert_eq!(
        query_column(&db, "SELECT * FROM early").await,
        Ok(vec!["India".to_string()])
    );
    db.close().await.expect("close");
}

#[tokio::test]
async fn test_chain_of_views_resolves_in_any_order() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;

    // v9 <- v8 <- ... <- v0 <- base, created top of the chain first
    for i in (1..10).rev() {
        create_view(&db, &format!("v{i}"), &format!("SELECT * FROM v{}", i - 1)).await;
    }
    create_view(&db, "v0", "SELECT * FROM base").await;
    create_table(&db, "base", "SELECT 'chained' AS label").await;

    assert_eq!(
        query_column(&db, "SELECT label FROM v9").await,
        Ok(vec!["chained".to_string()])
    );
    assert_eq!(db.list_tables().len(), 11);
    db.close().await.expect("close");
}

#[tokio::test]
async fn test_view_breaks_when_source_schema_changes() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;

    create_table(&db, "t", "SELECT 1 AS id, 'India' AS country").await;
    create_view(&db, "v", "SELECT country FROM t").await;
    assert_eq!(
        query_column(&db, "SELECT country FROM v").await,
        Ok(vec!["India".to_string()])
    );

    create_table(&db, "t", "SELECT 1 AS id").await;
    assert!(query_column(&db, "SELECT country FROM v").await.is_err());
    assert_eq!(
        query_column(&db, "SELECT id::VARCHAR FROM t").await,
        Ok(vec!["1".to_string()])
    );

    create_view(&db, "v", "SELECT id::VARCHAR AS id FROM t").await;
    assert_eq!(
        query_column(&db, "SELECT id FROM v").await,
        Ok(vec!["1".to_string()])
    );
    db.close().await.expect("close");
}

#[tokio::test]
async fn test_replacing_a_view_keeps_its_creation_order() {
    let dir = tempdir().expect("temp dir");
    let db = open_local(dir.path()).await;

    create_table(&db, "t", "SELECT 1 AS id").await;
    create_view(&db, "v", "SELECT id FROM t").await;
    let created = db.table("v").expect("view").created_version;

    create_view(&db, "v", "SELECT id + 1 AS id FROM t").await;
    let meta = db.table("v").expect("view");
    assert_eq!(meta.created_version, created);
    assert!(meta.version > created);

    create_table(&db, "v", "SELECT 5 AS id").await;
    let meta = db.table("v").expect("now a table");
    assert!(!meta.is_view());
    assert_eq!(meta.created_version, meta.version);
    db.close().await.expect("close");
}

#[tokio::test]
async fn test_views_survive_reopen() {
    let dir = tempdir().expect("temp dir");
    {
        let db = open_local(dir.path()).await;
        create_table(&db, "t", "SELECT 'India' AS country").await;
        create_view(&db, "v", "SELECT country FROM t").await;
        create_view(&db, "gone", "SELECT country FROM v").await;
        db.drop_table("gone").await.expect("drop view");
        db.close().await.expect("close");
    }

    let db = open_local(dir.path()).await;
    assert_eq!(
        query_column(&db, "SELECT country FROM v").await,
        Ok(vec!["India".to_string()])
    );
    assert!(db.table("gone").is_err());
    assert!(query_column(&db, "SELECT * FROM gone").await.is_err());
    db.close().await.expect("close");
}
