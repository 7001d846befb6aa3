//! Typed values: parameter tuples and row batches.

use crate::error::{Error, Result};

use super::{Builder, Cursor, ROWS_DONE, ROWS_PART};

/// SQLite native type codes.
pub const TYPE_INTEGER: u8 = 1;
pub const TYPE_FLOAT: u8 = 2;
pub const TYPE_TEXT: u8 = 3;
pub const TYPE_BLOB: u8 = 4;
pub const TYPE_NULL: u8 = 5;

/// Logical type codes layered on top of the SQLite ones.
pub const TYPE_UNIXTIME: u8 = 9;
pub const TYPE_ISO8601: u8 = 10;
pub const TYPE_BOOLEAN: u8 = 11;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
    /// Seconds since the epoch.
    UnixTime(i64),
    Iso8601(String),
    Boolean(u64),
}

impl Value {
    pub fn type_code(&self) -> u8 {
        match self {
            Value::Integer(_) => TYPE_INTEGER,
            Value::Float(_) => TYPE_FLOAT,
            Value::Text(_) => TYPE_TEXT,
            Value::Blob(_) => TYPE_BLOB,
            Value::Null => TYPE_NULL,
            Value::UnixTime(_) => TYPE_UNIXTIME,
            Value::Iso8601(_) => TYPE_ISO8601,
            Value::Boolean(_) => TYPE_BOOLEAN,
        }
    }

    fn decode(cursor: &mut Cursor, code: u8) -> Result<Value> {
        Ok(match code {
            TYPE_INTEGER => Value::Integer(cursor.get_i64()?),
            TYPE_FLOAT => Value::Float(cursor.get_f64()?),
            TYPE_TEXT => Value::Text(cursor.get_text()?.to_owned()),
            TYPE_BLOB => Value::Blob(cursor.get_blob()?.to_vec()),
            TYPE_NULL => {
                cursor.get_u64()?;
                Value::Null
            }
            TYPE_UNIXTIME => Value::UnixTime(cursor.get_i64()?),
            TYPE_ISO8601 => Value::Iso8601(cursor.get_text()?.to_owned()),
            TYPE_BOOLEAN => Value::Boolean(cursor.get_u64()?),
            _ => return Err(Error::Parse(format!("unknown parameter type {code}"))),
        })
    }

    fn encode(&self, builder: &mut Builder) {
        match self {
            Value::Integer(v) => builder.put_i64(*v),
            Value::Float(v) => builder.put_f64(*v),
            Value::Text(v) => builder.put_text(v),
            Value::Blob(v) => builder.put_blob(v),
            Value::Null => builder.put_u64(0),
            Value::UnixTime(v) => builder.put_i64(*v),
            Value::Iso8601(v) => builder.put_text(v),
            Value::Boolean(v) => builder.put_u64(*v),
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
        Ok(match self {
            Value::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::UnixTime(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Iso8601(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Boolean(v) => ToSqlOutput::Owned(SqlValue::Integer((*v != 0) as i64)),
        })
    }
}

impl From<rusqlite::types::Value> for Value {
    fn from(v: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value as SqlValue;
        match v {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(f) => Value::Float(f),
            SqlValue::Text(t) => Value::Text(t),
            SqlValue::Blob(b) => Value::Blob(b),
        }
    }
}

/// Decode a parameter tuple: `u8 n`, `n` type codes padded to a word
/// boundary, then the values in declared order.
pub fn decode_params(cursor: &mut Cursor) -> Result<Vec<Value>> {
    let n = cursor.get_u8()? as usize;
    let mut codes = Vec::with_capacity(n);
    for _ in 0..n {
        codes.push(cursor.get_u8()?);
    }
    let consumed = 1 + n;
    let pad = (super::WORD_SIZE - consumed % super::WORD_SIZE) % super::WORD_SIZE;
    cursor.get_bytes(pad)?;

    let mut values = Vec::with_capacity(n);
    for code in codes {
        values.push(Value::decode(cursor, code)?);
    }
    Ok(values)
}

/// Encode a parameter tuple; the client-side dual of [`decode_params`].
pub fn encode_params(builder: &mut Builder, params: &[Value]) {
    builder.put_u8(params.len() as u8);
    for value in params {
        builder.put_u8(value.type_code());
    }
    builder.pad();
    for value in params {
        value.encode(builder);
    }
}

/// Incrementally encodes a batch of rows into a response body.
///
/// Each row starts with a packed header of 4-bit type tags, two per byte
/// with the first tag in the low nibble, padded to a word boundary, followed
/// by the values. The batch ends with [`ROWS_PART`] when more rows follow in
/// another message, or [`ROWS_DONE`] when the result set is complete.
pub struct RowsEncoder {
    builder: Builder,
    budget: usize,
}

impl RowsEncoder {
    pub fn new(columns: &[String], budget: usize) -> Self {
        let mut builder = Builder::new();
        builder.put_u64(columns.len() as u64);
        for column in columns {
            builder.put_text(column);
        }
        Self { builder, budget }
    }

    /// True if the encoder has room for another row.
    pub fn has_budget(&self) -> bool {
        self.builder.len() < self.budget
    }

    pub fn push_row(&mut self, row: &[Value]) {
        let mut header = vec![0u8; row.len().div_ceil(2)];
        for (i, value) in row.iter().enumerate() {
            let tag = value.type_code() & 0x0f;
            header[i / 2] |= if i % 2 == 0 { tag } else { tag << 4 };
        }
        for byte in header {
            self.builder.put_u8(byte);
        }
        self.builder.pad();
        for value in row {
            value.encode(&mut self.builder);
        }
    }

    pub fn finish(mut self, done: bool) -> bytes::BytesMut {
        self.builder.put_u64(if done { ROWS_DONE } else { ROWS_PART });
        self.builder.finish()
    }
}

/// Decoded batch of rows, as read back by a client.
#[derive(Debug, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub done: bool,
}

/// Decode one ROWS message body.
pub fn decode_rows(cursor: &mut Cursor) -> Result<Rows> {
    let n_cols = cursor.get_u64()? as usize;
    let mut columns = Vec::with_capacity(n_cols);
    for _ in 0..n_cols {
        columns.push(cursor.get_text()?.to_owned());
    }

    let mut rows = Vec::new();
    loop {
        // A row header word never matches a sentinel, since type tags are
        // 1..=11 and at least one nibble of the first byte is a real tag.
        if cursor.remaining() < super::WORD_SIZE {
            return Err(Error::Parse("rows batch missing sentinel".into()));
        }
        let mark = {
            let bytes = cursor.get_bytes(8)?;
            u64::from_le_bytes(bytes.try_into().unwrap())
        };
        match mark {
            ROWS_DONE => return Ok(Rows { columns, rows, done: true }),
            ROWS_PART => return Ok(Rows { columns, rows, done: false }),
            _ => {}
        }

        // Not a sentinel: those 8 bytes begin the packed tag header.
        let header_len = n_cols.div_ceil(2);
        let padded = header_len.next_multiple_of(super::WORD_SIZE);
        let mut tags = Vec::with_capacity(n_cols);
        let head = mark.to_le_bytes();
        let mut header: Vec<u8> = head.to_vec();
        if padded > 8 {
            header.extend_from_slice(cursor.get_bytes(padded - 8)?);
        }
        for i in 0..n_cols {
            let byte = header[i / 2];
            tags.push(if i % 2 == 0 { byte & 0x0f } else { byte >> 4 });
        }

        let mut row = Vec::with_capacity(n_cols);
        for tag in tags {
            row.push(Value::decode(cursor, tag)?);
        }
        rows.push(row);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn params_round_trip() {
        let params = vec![
            Value::Integer(42),
            Value::Text("hi".into()),
            Value::Null,
            Value::Float(1.5),
            Value::Boolean(1),
            Value::Blob(vec![1, 2, 3]),
        ];
        let mut builder = Builder::new();
        encode_params(&mut builder, &params);
        let body = builder.finish();

        let mut cursor = Cursor::new(&body);
        let decoded = decode_params(&mut cursor).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn bad_param_type_rejected() {
        let mut builder = Builder::new();
        builder.put_u8(1);
        builder.put_u8(12);
        builder.pad();
        builder.put_u64(0);
        let body = builder.finish();
        let mut cursor = Cursor::new(&body);
        assert!(matches!(decode_params(&mut cursor), Err(Error::Parse(_))));
    }

    #[test]
    fn rows_round_trip() {
        let columns = vec!["n".to_string(), "t".to_string()];
        let mut encoder = RowsEncoder::new(&columns, 4096);
        encoder.push_row(&[Value::Integer(1), Value::Text("one".into())]);
        encoder.push_row(&[Value::Integer(2), Value::Null]);
        let body = encoder.finish(true);

        let mut cursor = Cursor::new(&body);
        let rows = decode_rows(&mut cursor).unwrap();
        assert!(rows.done);
        assert_eq!(rows.columns, columns);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0], vec![Value::Integer(1), Value::Text("one".into())]);
        assert_eq!(rows.rows[1], vec![Value::Integer(2), Value::Null]);
    }

    #[test]
    fn rows_part_sentinel() {
        let columns = vec!["n".to_string()];
        let mut encoder = RowsEncoder::new(&columns, 4096);
        encoder.push_row(&[Value::Integer(7)]);
        let body = encoder.finish(false);

        let mut cursor = Cursor::new(&body);
        let rows = decode_rows(&mut cursor).unwrap();
        assert!(!rows.done);
        assert_eq!(rows.rows, vec![vec![Value::Integer(7)]]);
    }

    #[test]
    fn budget_tracks_size() {
        let columns = vec!["n".to_string()];
        let mut encoder = RowsEncoder::new(&columns, 64);
        while encoder.has_budget() {
            encoder.push_row(&[Value::Integer(0)]);
        }
        let body = encoder.finish(false);
        assert!(body.len() >= 64);
    }
}
