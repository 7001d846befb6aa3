//! Per-connection request dispatcher.
//!
//! Each connected client gets a gateway: it owns at most one database
//! handle (a SQLite connection living on a dedicated blocking task), a
//! table of prepared statements with dense reusable ids, and two request
//! contexts — one long-running data request plus one concurrent control
//! request (heartbeat or interrupt). Responses are emitted in request
//! order; queries stream row batches under backpressure from the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::raft::NodeHandle;
use crate::replication::Replication;
use crate::stats::Stats;
use crate::wire::value::RowsEncoder;
use crate::wire::{Frame, Request, Response, Value, RESPONSE_BUFFER_SIZE};

/// The id assigned to the (single) database a client can open.
const DB_ID: u32 = 0;

enum DbOp {
    Prepare {
        sql: String,
        ret: oneshot::Sender<Result<(u32, u64)>>,
    },
    Exec {
        stmt_id: u32,
        params: Vec<Value>,
        ret: oneshot::Sender<Result<(u64, u64)>>,
    },
    Query {
        stmt_id: u32,
        params: Vec<Value>,
        batches: mpsc::Sender<Result<BytesMut>>,
    },
    ExecSql {
        sql: String,
        params: Vec<Value>,
        ret: oneshot::Sender<Result<(u64, u64)>>,
    },
    QuerySql {
        sql: String,
        params: Vec<Value>,
        batches: mpsc::Sender<Result<BytesMut>>,
    },
    Finalize {
        stmt_id: u32,
        ret: oneshot::Sender<Result<()>>,
    },
}

struct DbHandle {
    ops: mpsc::Sender<DbOp>,
    interrupt: Arc<AtomicBool>,
}

/// The response stream of the in-flight data request.
enum InFlight {
    Single(oneshot::Receiver<Response>),
    Rows(mpsc::Receiver<Result<BytesMut>>),
}

/// How a request was dispatched.
enum Dispatch {
    Immediate(Response),
    Started(InFlight),
}

pub struct Gateway {
    config: Config,
    node: NodeHandle,
    replication: Arc<Replication>,
    stats: Arc<Stats>,
    client_id: u64,
    db: Option<DbHandle>,
}

impl Gateway {
    pub fn new(
        config: Config,
        node: NodeHandle,
        replication: Arc<Replication>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            config,
            node,
            replication,
            stats,
            client_id: 0,
            db: None,
        }
    }

    /// Serve one client connection until it disconnects, times out or
    /// commits a protocol violation.
    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
        mut self,
        stream: S,
    ) -> Result<()> {
        let (read_half, mut writer) = tokio::io::split(stream);
        // A dedicated reader keeps frame reads cancel-safe while row
        // batches and timeouts race in the main loop.
        let (frames_tx, mut frames) = mpsc::channel::<Result<Frame>>(1);
        tokio::spawn(async move {
            let mut reader = read_half;
            loop {
                let frame = Frame::read(&mut reader).await;
                let failed = frame.is_err();
                if frames_tx.send(frame).await.is_err() || failed {
                    return;
                }
            }
        });

        let mut in_flight: Option<InFlight> = None;
        let mut pending_interrupt = false;
        let mut last_heartbeat = Instant::now();

        loop {
            let deadline = last_heartbeat + self.config.heartbeat_timeout;
            tokio::select! {
                frame = frames.recv() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(Error::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            let _ = write_response(&mut writer, &Response::failure(&e)).await;
                            return Err(e);
                        }
                        None => return Ok(()),
                    };
                    let request = match Request::decode(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            let _ = write_response(&mut writer, &Response::failure(&e)).await;
                            if e.is_fatal() {
                                return Err(e);
                            }
                            continue;
                        }
                    };
                    self.stats.record_request();

                    match request {
                        Request::Heartbeat { .. } => {
                            last_heartbeat = Instant::now();
                            let response = self.handle_heartbeat().await;
                            write_response(&mut writer, &response).await?;
                        }
                        Request::Interrupt { .. } => {
                            if let Some(db) = &self.db {
                                db.interrupt.store(true, Ordering::SeqCst);
                            }
                            if in_flight.is_some() {
                                // Reply once the aborted stream drains.
                                pending_interrupt = true;
                            } else {
                                write_response(&mut writer, &Response::Empty).await?;
                            }
                        }
                        _ if in_flight.is_some() => {
                            let err = Error::Proto("concurrent request limit exceeded".into());
                            let _ = write_response(&mut writer, &Response::failure(&err)).await;
                            return Err(err);
                        }
                        request => match self.start_request(request).await {
                            Dispatch::Immediate(response) => {
                                write_response(&mut writer, &response).await?;
                            }
                            Dispatch::Started(flight) => in_flight = Some(flight),
                        },
                    }
                }
                (response, done) = recv_flight(&mut in_flight), if in_flight.is_some() => {
                    write_response(&mut writer, &response).await?;
                    if done {
                        in_flight = None;
                        if pending_interrupt {
                            pending_interrupt = false;
                            if let Some(db) = &self.db {
                                db.interrupt.store(false, Ordering::SeqCst);
                            }
                            write_response(&mut writer, &Response::Empty).await?;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("client {} heartbeat timed out", self.client_id);
                    return Ok(());
                }
            }
        }
    }

    async fn handle_heartbeat(&self) -> Response {
        match self.node.status().await {
            Ok(status) => Response::Servers { servers: status.servers },
            Err(e) => Response::failure(&e),
        }
    }

    async fn start_request(&mut self, request: Request) -> Dispatch {
        match request {
            Request::Leader => match self.node.status().await {
                Ok(status) => Dispatch::Immediate(Response::Server {
                    address: status.leader_address.unwrap_or_default(),
                }),
                Err(e) => Dispatch::Immediate(Response::failure(&e)),
            },
            Request::Client { id } => {
                self.client_id = id;
                Dispatch::Immediate(Response::Welcome {
                    heartbeat_timeout: self.config.heartbeat_timeout.as_millis() as u64,
                })
            }
            Request::Open { name, .. } => {
                if self.db.is_some() {
                    // One registry slot per client; reopening is idempotent.
                    return Dispatch::Immediate(Response::Db { id: DB_ID });
                }
                // Catch up with the committed log before serving the
                // database, so a fresh leader exposes current data.
                if let Err(e) = self.replication.barrier().await {
                    return Dispatch::Immediate(Response::failure(&e));
                }
                match self.open_db(&name).await {
                    Ok(db) => {
                        self.db = Some(db);
                        Dispatch::Immediate(Response::Db { id: DB_ID })
                    }
                    Err(e) => Dispatch::Immediate(Response::failure(&e)),
                }
            }
            Request::Prepare { db_id, sql } => self.dispatch_single(db_id, |ret| {
                DbOp::Prepare { sql, ret }
            }, |(id, params)| Response::Stmt { db_id: DB_ID, id, params })
            .await,
            Request::Exec { db_id, stmt_id, params } => self
                .dispatch_single(db_id as u64, |ret| DbOp::Exec { stmt_id, params, ret }, result_response)
                .await,
            Request::Query { db_id, stmt_id, params } => {
                self.dispatch_rows(db_id as u64, |batches| DbOp::Query { stmt_id, params, batches })
                    .await
            }
            Request::Finalize { db_id, stmt_id } => self
                .dispatch_single(db_id as u64, |ret| DbOp::Finalize { stmt_id, ret }, |()| {
                    Response::Empty
                })
                .await,
            Request::ExecSql { db_id, sql, params } => self
                .dispatch_single(db_id, |ret| DbOp::ExecSql { sql, params, ret }, result_response)
                .await,
            Request::QuerySql { db_id, sql, params } => {
                self.dispatch_rows(db_id, |batches| DbOp::QuerySql { sql, params, batches })
                    .await
            }
            Request::Heartbeat { .. } | Request::Interrupt { .. } => unreachable!(),
        }
    }

    async fn dispatch_single<T: Send + 'static>(
        &mut self,
        db_id: u64,
        op: impl FnOnce(oneshot::Sender<Result<T>>) -> DbOp,
        into: impl FnOnce(T) -> Response + Send + 'static,
    ) -> Dispatch {
        let db = match self.db_for(db_id) {
            Ok(db) => db,
            Err(response) => return Dispatch::Immediate(response),
        };
        let (ret, rx) = oneshot::channel();
        if db.ops.send(op(ret)).await.is_err() {
            return Dispatch::Immediate(Response::failure(&Error::Stopped));
        }
        let (tx, out) = oneshot::channel();
        tokio::spawn(async move {
            let response = match rx.await {
                Ok(Ok(value)) => into(value),
                Ok(Err(e)) => Response::failure(&e),
                Err(_) => Response::failure(&Error::Stopped),
            };
            let _ = tx.send(response);
        });
        Dispatch::Started(InFlight::Single(out))
    }

    async fn dispatch_rows(
        &mut self,
        db_id: u64,
        op: impl FnOnce(mpsc::Sender<Result<BytesMut>>) -> DbOp,
    ) -> Dispatch {
        let db = match self.db_for(db_id) {
            Ok(db) => db,
            Err(response) => return Dispatch::Immediate(response),
        };
        let (batches, rx) = mpsc::channel(1);
        if db.ops.send(op(batches)).await.is_err() {
            return Dispatch::Immediate(Response::failure(&Error::Stopped));
        }
        Dispatch::Started(InFlight::Rows(rx))
    }

    fn db_for(&self, db_id: u64) -> std::result::Result<&DbHandle, Response> {
        match &self.db {
            Some(db) if db_id == DB_ID as u64 => Ok(db),
            _ => Err(Response::failure(&Error::NotFound(format!(
                "no db with id {db_id}"
            )))),
        }
    }

    async fn open_db(&self, name: &str) -> Result<DbHandle> {
        let (ops, rx) = mpsc::channel(8);
        let interrupt = Arc::new(AtomicBool::new(false));
        let (ready, ready_rx) = oneshot::channel();
        let name = name.to_string();
        let vfs_name = self.config.vfs_name.clone();
        let interrupt_flag = interrupt.clone();
        tokio::task::spawn_blocking(move || {
            run_executor(name, vfs_name, rx, interrupt_flag, ready);
        });
        ready_rx.await.map_err(|_| Error::Stopped)??;
        Ok(DbHandle { ops, interrupt })
    }
}

fn result_response((last_insert_id, rows_affected): (u64, u64)) -> Response {
    Response::Result { last_insert_id, rows_affected }
}

async fn recv_flight(in_flight: &mut Option<InFlight>) -> (Response, bool) {
    match in_flight {
        Some(InFlight::Single(rx)) => {
            let response = (&mut *rx)
                .await
                .unwrap_or_else(|_| Response::failure(&Error::Stopped));
            (response, true)
        }
        Some(InFlight::Rows(rx)) => match rx.recv().await {
            Some(Ok(body)) => {
                let done = is_final_batch(&body);
                (Response::Rows { body }, done)
            }
            Some(Err(e)) => (Response::failure(&e), true),
            None => (Response::failure(&Error::Stopped), true),
        },
        None => std::future::pending().await,
    }
}

fn is_final_batch(body: &BytesMut) -> bool {
    body.len() >= 8 && body[body.len() - 8..] == crate::wire::ROWS_DONE.to_le_bytes()
}

async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<()> {
    let body = response.encode();
    Frame::write(writer, response.type_code(), 0, &body).await
}

/// The blocking task owning one SQLite connection and its prepared
/// statements. Statement ids are dense and reused after finalize.
fn run_executor(
    db_name: String,
    vfs_name: String,
    mut rx: mpsc::Receiver<DbOp>,
    interrupt: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<()>>,
) {
    use rusqlite::OpenFlags;
    let conn = match rusqlite::Connection::open_with_flags_and_vfs(
        &db_name,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        &vfs_name,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let init = conn
        .busy_timeout(std::time::Duration::from_millis(1000))
        .map_err(Error::from)
        .and_then(|_| {
            conn.pragma_update(None, "wal_autocheckpoint", 0)?;
            let mode: String =
                conn.query_row("PRAGMA journal_mode=wal", [], |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                return Err(Error::Internal(format!("journal mode is {mode}, not wal")));
            }
            Ok(())
        });
    if let Err(e) = init {
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut statements: Vec<Option<rusqlite::Statement>> = Vec::new();

    while let Some(op) = rx.blocking_recv() {
        match op {
            DbOp::Prepare { sql, ret } => {
                let result = conn.prepare(&sql).map(|stmt| {
                    let params = stmt.parameter_count() as u64;
                    let slot = statements.iter().position(|s| s.is_none());
                    let id = match slot {
                        Some(slot) => {
                            statements[slot] = Some(stmt);
                            slot as u32
                        }
                        None => {
                            statements.push(Some(stmt));
                            (statements.len() - 1) as u32
                        }
                    };
                    (id, params)
                });
                let _ = ret.send(result.map_err(Into::into));
            }
            DbOp::Exec { stmt_id, params, ret } => {
                let result = match statement_at(&mut statements, stmt_id) {
                    Ok(stmt) => exec_statement(&conn, stmt, &params),
                    Err(e) => Err(e),
                };
                let _ = ret.send(result);
            }
            DbOp::Query { stmt_id, params, batches } => {
                match statement_at(&mut statements, stmt_id) {
                    Ok(stmt) => query_statement(stmt, &params, &batches, &interrupt),
                    Err(e) => {
                        let _ = batches.blocking_send(Err(e));
                    }
                }
            }
            DbOp::ExecSql { sql, params, ret } => {
                let result = conn
                    .prepare(&sql)
                    .map_err(Into::into)
                    .and_then(|mut stmt| exec_statement(&conn, &mut stmt, &params));
                let _ = ret.send(result);
            }
            DbOp::QuerySql { sql, params, batches } => match conn.prepare(&sql) {
                Ok(mut stmt) => query_statement(&mut stmt, &params, &batches, &interrupt),
                Err(e) => {
                    let _ = batches.blocking_send(Err(e.into()));
                }
            },
            DbOp::Finalize { stmt_id, ret } => {
                let result = match statements.get_mut(stmt_id as usize) {
                    Some(slot) if slot.is_some() => {
                        *slot = None;
                        Ok(())
                    }
                    _ => Err(Error::NotFound(format!("no stmt with id {stmt_id}"))),
                };
                let _ = ret.send(result);
            }
        }
    }
}

fn statement_at<'a, 'conn>(
    statements: &'a mut [Option<rusqlite::Statement<'conn>>],
    stmt_id: u32,
) -> Result<&'a mut rusqlite::Statement<'conn>> {
    statements
        .get_mut(stmt_id as usize)
        .and_then(|slot| slot.as_mut())
        .ok_or_else(|| Error::NotFound(format!("no stmt with id {stmt_id}")))
}

fn exec_statement(
    conn: &rusqlite::Connection,
    stmt: &mut rusqlite::Statement,
    params: &[Value],
) -> Result<(u64, u64)> {
    let rows_affected = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
    Ok((conn.last_insert_rowid() as u64, rows_affected as u64))
}

fn query_statement(
    stmt: &mut rusqlite::Statement,
    params: &[Value],
    batches: &mpsc::Sender<Result<BytesMut>>,
    interrupt: &AtomicBool,
) {
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = match stmt.query(rusqlite::params_from_iter(params.iter())) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = batches.blocking_send(Err(e.into()));
            return;
        }
    };

    let mut encoder = RowsEncoder::new(&columns, RESPONSE_BUFFER_SIZE);
    loop {
        if interrupt.load(Ordering::SeqCst) {
            break;
        }
        match rows.next() {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    match row.get::<_, rusqlite::types::Value>(i) {
                        Ok(value) => values.push(Value::from(value)),
                        Err(e) => {
                            let _ = batches.blocking_send(Err(e.into()));
                            return;
                        }
                    }
                }
                encoder.push_row(&values);
                if !encoder.has_budget() {
                    // Flush a full buffer and keep streaming; the bounded
                    // channel provides the flushed() backpressure.
                    let batch = std::mem::replace(
                        &mut encoder,
                        RowsEncoder::new(&columns, RESPONSE_BUFFER_SIZE),
                    );
                    if batches.blocking_send(Ok(batch.finish(false))).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = batches.blocking_send(Err(e.into()));
                return;
            }
        }
    }
    let _ = batches.blocking_send(Ok(encoder.finish(true)));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn final_batch_detection() {
        let mut encoder = RowsEncoder::new(&["n".to_string()], RESPONSE_BUFFER_SIZE);
        encoder.push_row(&[Value::Integer(1)]);
        assert!(is_final_batch(&encoder.finish(true)));

        let mut encoder = RowsEncoder::new(&["n".to_string()], RESPONSE_BUFFER_SIZE);
        encoder.push_row(&[Value::Integer(1)]);
        assert!(!is_final_batch(&encoder.finish(false)));
    }
}
