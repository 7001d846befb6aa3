#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use duralite::wire::value::{decode_rows, Value};
use duralite::wire::{Cursor, Frame, Request, Response, PROTOCOL_VERSION};
use duralite::{Config, Server};

pub struct TestServer {
    pub server: Server,
    pub addr: SocketAddr,
    _dir: tempfile::TempDir,
}

pub fn test_config(name: &str, dir: &std::path::Path) -> Config {
    Config {
        id: 1,
        address: "1".to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.to_path_buf(),
        vfs_name: format!("duralite-{name}"),
        ..Config::default()
    }
}

/// Bootstrap and start a one-member cluster, waiting for it to elect
/// itself.
pub async fn start_one(name: &str, configure: impl FnOnce(&mut Config)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(name, dir.path());
    configure(&mut config);
    Server::bootstrap(&config, vec![(1, "1".to_string())])
        .await
        .unwrap();
    let server = Server::start(config).await.unwrap();
    wait_for_leader(&server).await;
    let addr = server.local_addr();
    TestServer { server, addr, _dir: dir }
}

pub async fn wait_for_leader(server: &Server) {
    for _ in 0..100 {
        if let Ok(status) = server.status().await {
            if status.leader_id != 0 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no leader elected within 10s");
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&PROTOCOL_VERSION.to_le_bytes())
            .await
            .unwrap();
        Client { stream }
    }

    pub async fn send(&mut self, request: &Request) {
        let body = request.encode();
        Frame::write(&mut self.stream, request.type_code(), 0, &body)
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Response {
        let frame = Frame::read(&mut self.stream).await.unwrap();
        Response::decode(&frame).unwrap()
    }

    pub async fn call(&mut self, request: Request) -> Response {
        self.send(&request).await;
        self.recv().await
    }

    /// Run a query and collect every batch, asserting the sentinel
    /// discipline: every batch but the last says "more", the last says
    /// "done".
    pub async fn query(&mut self, request: Request) -> QueryResult {
        self.send(&request).await;
        let mut batches = 0usize;
        let mut columns = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        loop {
            match self.recv().await {
                Response::Rows { body } => {
                    batches += 1;
                    let mut cursor = Cursor::new(&body);
                    let batch = decode_rows(&mut cursor).unwrap();
                    columns = batch.columns;
                    rows.extend(batch.rows);
                    if batch.done {
                        return QueryResult { columns, rows, batches };
                    }
                }
                Response::Failure { code, message } => {
                    panic!("query failed: {code} {message}");
                }
                other => panic!("unexpected response {other:?}"),
            }
        }
    }

    pub async fn open(&mut self, name: &str) -> u32 {
        match self
            .call(Request::Open {
                name: name.to_string(),
                flags: 6,
                vfs: "duralite".to_string(),
            })
            .await
        {
            Response::Db { id } => id,
            other => panic!("open failed: {other:?}"),
        }
    }

    pub async fn exec_sql(&mut self, sql: &str, params: Vec<Value>) -> (u64, u64) {
        match self
            .call(Request::ExecSql { db_id: 0, sql: sql.to_string(), params })
            .await
        {
            Response::Result { last_insert_id, rows_affected } => {
                (last_insert_id, rows_affected)
            }
            other => panic!("exec failed: {other:?}"),
        }
    }
}

pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub batches: usize,
}
