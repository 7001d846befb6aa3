//! Property tests for the wire codec.

use proptest::prelude::*;

use duralite::wire::value::{decode_params, decode_rows, encode_params, RowsEncoder, Value};
use duralite::wire::{Builder, Cursor};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        any::<i64>().prop_map(|n| Value::Float(n as f64)),
        "[a-zA-Z0-9 ]{0,40}".prop_map(Value::Text),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Blob),
        Just(Value::Null),
        any::<i64>().prop_map(Value::UnixTime),
        "[0-9:TZ-]{0,24}".prop_map(Value::Iso8601),
        any::<bool>().prop_map(|b| Value::Boolean(b as u64)),
    ]
}

proptest! {
    #[test]
    fn params_round_trip(params in proptest::collection::vec(value_strategy(), 0..20)) {
        let mut builder = Builder::new();
        encode_params(&mut builder, &params);
        let body = builder.finish();

        let mut cursor = Cursor::new(&body);
        let decoded = decode_params(&mut cursor).unwrap();
        prop_assert_eq!(decoded, params);
        prop_assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn rows_round_trip(
        columns in proptest::collection::vec("[a-z]{1,8}", 1..8),
        rows in proptest::collection::vec(
            proptest::collection::vec(value_strategy(), 0..8),
            0..20,
        ),
        done in any::<bool>(),
    ) {
        let n_cols = columns.len();
        let rows: Vec<Vec<Value>> = rows
            .into_iter()
            .map(|mut row| {
                row.resize(n_cols, Value::Null);
                row
            })
            .collect();

        let mut encoder = RowsEncoder::new(&columns, usize::MAX);
        for row in &rows {
            encoder.push_row(row);
        }
        let body = encoder.finish(done);

        let mut cursor = Cursor::new(&body);
        let decoded = decode_rows(&mut cursor).unwrap();
        prop_assert_eq!(decoded.columns, columns);
        prop_assert_eq!(decoded.rows, rows);
        prop_assert_eq!(decoded.done, done);
    }
}
