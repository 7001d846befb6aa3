//! Server response types and encoding.

use bytes::BytesMut;

use crate::error::{Error, Result};

use super::{Builder, Cursor, Frame};

pub const RESPONSE_FAILURE: u8 = 0;
pub const RESPONSE_SERVER: u8 = 1;
pub const RESPONSE_WELCOME: u8 = 2;
pub const RESPONSE_SERVERS: u8 = 3;
pub const RESPONSE_DB: u8 = 4;
pub const RESPONSE_STMT: u8 = 5;
pub const RESPONSE_RESULT: u8 = 6;
pub const RESPONSE_ROWS: u8 = 7;
pub const RESPONSE_EMPTY: u8 = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Failure { code: u64, message: String },
    Server { address: String },
    Welcome { heartbeat_timeout: u64 },
    Servers { servers: Vec<(u64, String)> },
    Db { id: u32 },
    Stmt { db_id: u32, id: u32, params: u64 },
    Result { last_insert_id: u64, rows_affected: u64 },
    /// Pre-encoded row batch produced by a `RowsEncoder`.
    Rows { body: BytesMut },
    Empty,
}

impl Response {
    pub fn type_code(&self) -> u8 {
        match self {
            Response::Failure { .. } => RESPONSE_FAILURE,
            Response::Server { .. } => RESPONSE_SERVER,
            Response::Welcome { .. } => RESPONSE_WELCOME,
            Response::Servers { .. } => RESPONSE_SERVERS,
            Response::Db { .. } => RESPONSE_DB,
            Response::Stmt { .. } => RESPONSE_STMT,
            Response::Result { .. } => RESPONSE_RESULT,
            Response::Rows { .. } => RESPONSE_ROWS,
            Response::Empty => RESPONSE_EMPTY,
        }
    }

    pub fn failure(err: &crate::error::Error) -> Response {
        Response::Failure {
            code: err.failure_code(),
            message: err.failure_message(),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut b = Builder::new();
        match self {
            Response::Failure { code, message } => {
                b.put_u64(*code);
                b.put_text(message);
            }
            Response::Server { address } => b.put_text(address),
            Response::Welcome { heartbeat_timeout } => b.put_u64(*heartbeat_timeout),
            Response::Servers { servers } => {
                for (id, address) in servers {
                    b.put_u64(*id);
                    b.put_text(address);
                }
            }
            Response::Db { id } => {
                b.put_u32(*id);
                b.put_u32(0);
            }
            Response::Stmt { db_id, id, params } => {
                b.put_u32(*db_id);
                b.put_u32(*id);
                b.put_u64(*params);
            }
            Response::Result { last_insert_id, rows_affected } => {
                b.put_u64(*last_insert_id);
                b.put_u64(*rows_affected);
            }
            Response::Rows { body } => return body.clone(),
            Response::Empty => b.put_u64(0),
        }
        b.finish()
    }

    /// Decode a response frame; used by the test client.
    pub fn decode(frame: &Frame) -> Result<Response> {
        let mut cursor = Cursor::new(&frame.body);
        let response = match frame.kind {
            RESPONSE_FAILURE => Response::Failure {
                code: cursor.get_u64()?,
                message: cursor.get_text()?.to_owned(),
            },
            RESPONSE_SERVER => Response::Server { address: cursor.get_text()?.to_owned() },
            RESPONSE_WELCOME => Response::Welcome { heartbeat_timeout: cursor.get_u64()? },
            RESPONSE_SERVERS => {
                let mut servers = Vec::new();
                while cursor.remaining() > 0 {
                    let id = cursor.get_u64()?;
                    let address = cursor.get_text()?.to_owned();
                    servers.push((id, address));
                }
                Response::Servers { servers }
            }
            RESPONSE_DB => {
                let id = cursor.get_u32()?;
                cursor.get_u32()?;
                Response::Db { id }
            }
            RESPONSE_STMT => Response::Stmt {
                db_id: cursor.get_u32()?,
                id: cursor.get_u32()?,
                params: cursor.get_u64()?,
            },
            RESPONSE_RESULT => Response::Result {
                last_insert_id: cursor.get_u64()?,
                rows_affected: cursor.get_u64()?,
            },
            RESPONSE_ROWS => Response::Rows { body: frame.body.clone() },
            RESPONSE_EMPTY => {
                cursor.get_u64()?;
                Response::Empty
            }
            other => return Err(Error::Proto(format!("unknown response type {other}"))),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(response: Response) {
        let body = response.encode();
        let frame = Frame {
            kind: response.type_code(),
            flags: 0,
            body: BytesMut::from(&body[..]),
        };
        assert_eq!(Response::decode(&frame).unwrap(), response);
    }

    #[test]
    fn encode_all_types() {
        round_trip(Response::Failure { code: 8, message: "no stmt with id 0".into() });
        round_trip(Response::Server { address: "127.0.0.1:666".into() });
        round_trip(Response::Welcome { heartbeat_timeout: 15000 });
        round_trip(Response::Servers {
            servers: vec![(1, "1.2.3.4:666".into()), (2, "5.6.7.8:666".into())],
        });
        round_trip(Response::Db { id: 0 });
        round_trip(Response::Stmt { db_id: 0, id: 3, params: 1 });
        round_trip(Response::Result { last_insert_id: 2, rows_affected: 2 });
        round_trip(Response::Empty);
    }
}
