use std::sync::Arc;

use pgwire::api::results::{DataRowEncoder, FieldInfo};
use pgwire::error::PgWireResult;
use pgwire::messages::data::DataRow;
use rusqlite::types::Value;

use crate::encoder::encode_value;

/// Encodes a collected result set row by row against a fixed field list.
pub struct RowEncoder {
    rows: Vec<Vec<Value>>,
    curr_idx: usize,
    fields: Arc<Vec<FieldInfo>>,
}

impl RowEncoder {
    pub fn new(rows: Vec<Vec<Value>>, fields: Arc<Vec<FieldInfo>>) -> Self {
        Self {
            rows,
            curr_idx: 0,
            fields,
        }
    }

    pub fn next_row(&mut self) -> Option<PgWireResult<DataRow>> {
        if self.curr_idx == self.rows.len() {
            return None;
        }

        let row = &self.rows[self.curr_idx];
        let mut encoder = DataRowEncoder::new(self.fields.clone());
        for (value, field) in row.iter().zip(self.fields.iter()) {
            if let Err(e) = encode_value(&mut encoder, value, field.datatype()) {
                return Some(Err(e));
            }
        }
        self.curr_idx += 1;
        Some(encoder.finish())
    }
}
