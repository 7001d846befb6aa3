//! End-to-end scenarios against a one-member cluster.

mod common;

use std::time::Duration;

use common::{start_one, Client};
use duralite::error::{CODE_NOTFOUND, CODE_PROTO};
use duralite::wire::{Request, Response, Value};

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_and_single_write() {
    let ts = start_one("s1", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;

    assert_eq!(client.open("test.db").await, 0);

    let (last_insert_id, rows_affected) =
        client.exec_sql("CREATE TABLE t(n INT)", vec![]).await;
    assert_eq!((last_insert_id, rows_affected), (0, 0));

    let (last_insert_id, rows_affected) =
        client.exec_sql("INSERT INTO t VALUES(1),(2)", vec![]).await;
    assert_eq!((last_insert_id, rows_affected), (2, 2));

    let result = client
        .query(Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM t".to_string(),
            params: vec![],
        })
        .await;
    assert_eq!(result.columns, vec!["n".to_string()]);
    assert_eq!(result.rows, vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]);

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn prepare_exec_finalize_lifecycle() {
    let ts = start_one("s2", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;
    client.exec_sql("CREATE TABLE t(n INT)", vec![]).await;
    client.exec_sql("INSERT INTO t VALUES(1),(2)", vec![]).await;

    let stmt_id = match client
        .call(Request::Prepare { db_id: 0, sql: "INSERT INTO t VALUES(?)".into() })
        .await
    {
        Response::Stmt { id, params, .. } => {
            assert_eq!(params, 1);
            id
        }
        other => panic!("prepare failed: {other:?}"),
    };
    assert_eq!(stmt_id, 0);

    match client
        .call(Request::Exec {
            db_id: 0,
            stmt_id,
            params: vec![Value::Integer(42)],
        })
        .await
    {
        Response::Result { last_insert_id, rows_affected } => {
            assert_eq!((last_insert_id, rows_affected), (3, 1));
        }
        other => panic!("exec failed: {other:?}"),
    }

    assert_eq!(
        client.call(Request::Finalize { db_id: 0, stmt_id }).await,
        Response::Empty
    );

    match client
        .call(Request::Exec { db_id: 0, stmt_id, params: vec![] })
        .await
    {
        Response::Failure { code, message } => {
            assert_eq!(code, CODE_NOTFOUND);
            assert_eq!(message, "no stmt with id 0");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_sql_reports_engine_error() {
    let ts = start_one("s3", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;

    match client
        .call(Request::Prepare { db_id: 0, sql: "FOO bar".into() })
        .await
    {
        Response::Failure { code, message } => {
            assert_eq!(code, 1); // SQLITE_ERROR, verbatim
            assert!(message.contains("syntax error"), "{message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_db_id() {
    let ts = start_one("s4", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;

    match client
        .call(Request::Prepare { db_id: 123, sql: "SELECT 1".into() })
        .await
    {
        Response::Failure { code, message } => {
            assert_eq!(code, CODE_NOTFOUND);
            assert_eq!(message, "no db with id 123");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_and_heartbeat() {
    let ts = start_one("leader", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;

    match client.call(Request::Leader).await {
        Response::Server { address } => assert_eq!(address, "1"),
        other => panic!("unexpected {other:?}"),
    }

    match client.call(Request::Heartbeat { timestamp: 12345 }).await {
        Response::Servers { servers } => {
            assert_eq!(servers, vec![(1, "1".to_string())]);
        }
        other => panic!("unexpected {other:?}"),
    }

    match client.call(Request::Client { id: 123 }).await {
        Response::Welcome { heartbeat_timeout } => assert_eq!(heartbeat_timeout, 15_000),
        other => panic!("unexpected {other:?}"),
    }

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_request_limit() {
    let ts = start_one("cap", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;
    client.exec_sql("CREATE TABLE t(n INT)", vec![]).await;
    let values: Vec<String> = (0..3000).map(|i| format!("({i})")).collect();
    client
        .exec_sql(&format!("INSERT INTO t VALUES{}", values.join(",")), vec![])
        .await;

    // A large result set keeps the data slot busy: batches are emitted
    // under backpressure, so the stream cannot finish before we read it.
    client
        .send(&Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM t".to_string(),
            params: vec![],
        })
        .await;
    client
        .send(&Request::ExecSql {
            db_id: 0,
            sql: "SELECT 1".to_string(),
            params: vec![],
        })
        .await;

    // Row batches and the rejection may interleave; the rejection must
    // arrive before the stream is allowed to finish.
    let mut saw_limit = false;
    for _ in 0..1000 {
        match client.recv().await {
            Response::Failure { code, message } => {
                assert_eq!(code, CODE_PROTO);
                assert_eq!(message, "concurrent request limit exceeded");
                saw_limit = true;
                break;
            }
            Response::Rows { .. } => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(saw_limit);

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn row_streaming_sentinels() {
    let ts = start_one("rows", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;
    client.exec_sql("CREATE TABLE t(n INT)", vec![]).await;
    let values: Vec<String> = (0..2000).map(|i| format!("({i})")).collect();
    client
        .exec_sql(&format!("INSERT INTO t VALUES{}", values.join(",")), vec![])
        .await;

    let result = client
        .query(Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM t ORDER BY n".to_string(),
            params: vec![],
        })
        .await;
    assert!(result.batches >= 2, "expected multiple batches, got {}", result.batches);
    assert_eq!(result.rows.len(), 2000);
    assert_eq!(result.rows[7], vec![Value::Integer(7)]);

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_threshold_truncates_wal() {
    let ts = start_one("ckpt", |config| {
        config.checkpoint_threshold = 1;
    })
    .await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;
    client.exec_sql("CREATE TABLE t(n INT)", vec![]).await;
    client.exec_sql("INSERT INTO t VALUES(1)", vec![]).await;

    // The checkpoint runs on the maintenance task right after apply.
    let vfs = ts.server.replication().vfs().clone();
    let mut truncated = false;
    for _ in 0..50 {
        if vfs.read("test.db-wal").is_empty() {
            truncated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(truncated, "WAL was not truncated to zero");

    // The data survived the checkpoint.
    let result = client
        .query(Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM t".to_string(),
            params: vec![],
        })
        .await;
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_without_data_request() {
    let ts = start_one("interrupt", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;
    assert_eq!(
        client.call(Request::Interrupt { db_id: 0 }).await,
        Response::Empty
    );
    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn parameter_types_round_trip() {
    let ts = start_one("params", |_| {}).await;
    let mut client = Client::connect(ts.addr).await;
    client.open("test.db").await;
    client
        .exec_sql("CREATE TABLE t(i INT, f REAL, s TEXT, b BLOB, z, bl INT)", vec![])
        .await;
    let (_, rows_affected) = client
        .exec_sql(
            "INSERT INTO t VALUES(?,?,?,?,?,?)",
            vec![
                Value::Integer(-7),
                Value::Float(1.25),
                Value::Text("hello".into()),
                Value::Blob(vec![1, 2, 3]),
                Value::Null,
                Value::Boolean(1),
            ],
        )
        .await;
    assert_eq!(rows_affected, 1);

    let result = client
        .query(Request::QuerySql {
            db_id: 0,
            sql: "SELECT i, f, s, b, z, bl FROM t".to_string(),
            params: vec![],
        })
        .await;
    assert_eq!(
        result.rows,
        vec![vec![
            Value::Integer(-7),
            Value::Float(1.25),
            Value::Text("hello".into()),
            Value::Blob(vec![1, 2, 3]),
            Value::Null,
            Value::Integer(1),
        ]]
    );

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_replays_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::test_config("restart-a", dir.path());
    duralite::Server::bootstrap(&config, vec![(1, "1".to_string())])
        .await
        .unwrap();
    let server = duralite::Server::start(config).await.unwrap();
    common::wait_for_leader(&server).await;

    let mut client = Client::connect(server.local_addr()).await;
    client.open("test.db").await;
    client.exec_sql("CREATE TABLE t(n INT)", vec![]).await;
    client.exec_sql("INSERT INTO t VALUES(7)", vec![]).await;
    drop(client);
    server.stop().await;

    // A fresh process: empty VFS, state rebuilt from the durable log.
    let config = common::test_config("restart-b", dir.path());
    let server = duralite::Server::start(config).await.unwrap();
    common::wait_for_leader(&server).await;

    let mut client = Client::connect(server.local_addr()).await;
    client.open("test.db").await;
    let result = client
        .query(Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM t".to_string(),
            params: vec![],
        })
        .await;
    assert_eq!(result.rows, vec![vec![Value::Integer(7)]]);

    server.stop().await;
}
