//! Client request types and decoding.

use crate::error::{Error, Result};

use super::value::{decode_params, encode_params, Value};
use super::{Builder, Cursor, Frame};

pub const REQUEST_LEADER: u8 = 0;
pub const REQUEST_CLIENT: u8 = 1;
pub const REQUEST_HEARTBEAT: u8 = 2;
pub const REQUEST_OPEN: u8 = 3;
pub const REQUEST_PREPARE: u8 = 4;
pub const REQUEST_EXEC: u8 = 5;
pub const REQUEST_QUERY: u8 = 6;
pub const REQUEST_FINALIZE: u8 = 7;
pub const REQUEST_EXEC_SQL: u8 = 8;
pub const REQUEST_QUERY_SQL: u8 = 9;
pub const REQUEST_INTERRUPT: u8 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Leader,
    Client { id: u64 },
    Heartbeat { timestamp: u64 },
    Open { name: String, flags: u64, vfs: String },
    Prepare { db_id: u64, sql: String },
    Exec { db_id: u32, stmt_id: u32, params: Vec<Value> },
    Query { db_id: u32, stmt_id: u32, params: Vec<Value> },
    Finalize { db_id: u32, stmt_id: u32 },
    ExecSql { db_id: u64, sql: String, params: Vec<Value> },
    QuerySql { db_id: u64, sql: String, params: Vec<Value> },
    Interrupt { db_id: u64 },
}

impl Request {
    /// Heartbeat and interrupt are control requests: they are accepted even
    /// while a data request is in flight.
    pub fn is_control(&self) -> bool {
        matches!(self, Request::Heartbeat { .. } | Request::Interrupt { .. })
    }

    pub fn type_code(&self) -> u8 {
        match self {
            Request::Leader => REQUEST_LEADER,
            Request::Client { .. } => REQUEST_CLIENT,
            Request::Heartbeat { .. } => REQUEST_HEARTBEAT,
            Request::Open { .. } => REQUEST_OPEN,
            Request::Prepare { .. } => REQUEST_PREPARE,
            Request::Exec { .. } => REQUEST_EXEC,
            Request::Query { .. } => REQUEST_QUERY,
            Request::Finalize { .. } => REQUEST_FINALIZE,
            Request::ExecSql { .. } => REQUEST_EXEC_SQL,
            Request::QuerySql { .. } => REQUEST_QUERY_SQL,
            Request::Interrupt { .. } => REQUEST_INTERRUPT,
        }
    }

    pub fn decode(frame: &Frame) -> Result<Request> {
        let mut cursor = Cursor::new(&frame.body);
        let request = match frame.kind {
            REQUEST_LEADER => {
                cursor.get_u64()?;
                Request::Leader
            }
            REQUEST_CLIENT => Request::Client { id: cursor.get_u64()? },
            REQUEST_HEARTBEAT => Request::Heartbeat { timestamp: cursor.get_u64()? },
            REQUEST_OPEN => {
                let name = cursor.get_text()?.to_owned();
                let flags = cursor.get_u64()?;
                let vfs = cursor.get_text()?.to_owned();
                Request::Open { name, flags, vfs }
            }
            REQUEST_PREPARE => {
                let db_id = cursor.get_u64()?;
                let sql = cursor.get_text()?.to_owned();
                Request::Prepare { db_id, sql }
            }
            REQUEST_EXEC => {
                let db_id = cursor.get_u32()?;
                let stmt_id = cursor.get_u32()?;
                let params = if cursor.remaining() > 0 { decode_params(&mut cursor)? } else { Vec::new() };
                Request::Exec { db_id, stmt_id, params }
            }
            REQUEST_QUERY => {
                let db_id = cursor.get_u32()?;
                let stmt_id = cursor.get_u32()?;
                let params = if cursor.remaining() > 0 { decode_params(&mut cursor)? } else { Vec::new() };
                Request::Query { db_id, stmt_id, params }
            }
            REQUEST_FINALIZE => {
                let db_id = cursor.get_u32()?;
                let stmt_id = cursor.get_u32()?;
                Request::Finalize { db_id, stmt_id }
            }
            REQUEST_EXEC_SQL => {
                let db_id = cursor.get_u64()?;
                let sql = cursor.get_text()?.to_owned();
                let params = if cursor.remaining() > 0 { decode_params(&mut cursor)? } else { Vec::new() };
                Request::ExecSql { db_id, sql, params }
            }
            REQUEST_QUERY_SQL => {
                let db_id = cursor.get_u64()?;
                let sql = cursor.get_text()?.to_owned();
                let params = if cursor.remaining() > 0 { decode_params(&mut cursor)? } else { Vec::new() };
                Request::QuerySql { db_id, sql, params }
            }
            REQUEST_INTERRUPT => Request::Interrupt { db_id: cursor.get_u64()? },
            other => return Err(Error::Proto(format!("unknown request type {other}"))),
        };
        Ok(request)
    }

    /// Encode the request body; used by the test client.
    pub fn encode(&self) -> bytes::BytesMut {
        let mut b = Builder::new();
        match self {
            Request::Leader => b.put_u64(0),
            Request::Client { id } => b.put_u64(*id),
            Request::Heartbeat { timestamp } => b.put_u64(*timestamp),
            Request::Open { name, flags, vfs } => {
                b.put_text(name);
                b.put_u64(*flags);
                b.put_text(vfs);
            }
            Request::Prepare { db_id, sql } => {
                b.put_u64(*db_id);
                b.put_text(sql);
            }
            Request::Exec { db_id, stmt_id, params } => {
                b.put_u32(*db_id);
                b.put_u32(*stmt_id);
                if !params.is_empty() {
                    encode_params(&mut b, params);
                }
            }
            Request::Query { db_id, stmt_id, params } => {
                b.put_u32(*db_id);
                b.put_u32(*stmt_id);
                if !params.is_empty() {
                    encode_params(&mut b, params);
                }
            }
            Request::Finalize { db_id, stmt_id } => {
                b.put_u32(*db_id);
                b.put_u32(*stmt_id);
            }
            Request::ExecSql { db_id, sql, params } => {
                b.put_u64(*db_id);
                b.put_text(sql);
                if !params.is_empty() {
                    encode_params(&mut b, params);
                }
            }
            Request::QuerySql { db_id, sql, params } => {
                b.put_u64(*db_id);
                b.put_text(sql);
                if !params.is_empty() {
                    encode_params(&mut b, params);
                }
            }
            Request::Interrupt { db_id } => b.put_u64(*db_id),
        }
        b.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(request: Request) {
        let body = request.encode();
        let frame = Frame {
            kind: request.type_code(),
            flags: 0,
            body: BytesMut::from(&body[..]),
        };
        assert_eq!(Request::decode(&frame).unwrap(), request);
    }

    #[test]
    fn decode_all_types() {
        round_trip(Request::Leader);
        round_trip(Request::Client { id: 123 });
        round_trip(Request::Heartbeat { timestamp: 12345 });
        round_trip(Request::Open {
            name: "test.db".into(),
            flags: 6,
            vfs: "duralite".into(),
        });
        round_trip(Request::Prepare { db_id: 0, sql: "SELECT 1".into() });
        round_trip(Request::Exec {
            db_id: 0,
            stmt_id: 0,
            params: vec![Value::Integer(42)],
        });
        round_trip(Request::Query { db_id: 0, stmt_id: 1, params: vec![] });
        round_trip(Request::Finalize { db_id: 0, stmt_id: 0 });
        round_trip(Request::ExecSql {
            db_id: 0,
            sql: "INSERT INTO t VALUES(?)".into(),
            params: vec![Value::Text("x".into())],
        });
        round_trip(Request::QuerySql { db_id: 0, sql: "SELECT n FROM t".into(), params: vec![] });
        round_trip(Request::Interrupt { db_id: 0 });
    }

    #[test]
    fn unknown_type_rejected() {
        let frame = Frame { kind: 42, flags: 0, body: BytesMut::zeroed(8) };
        assert!(matches!(Request::decode(&frame), Err(Error::Proto(_))));
    }
}
