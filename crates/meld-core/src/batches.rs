//! JSON rows <-> Arrow record batches.
//!
//! REST pages arrive as JSON objects and leave as Arrow batches headed for a
//! backend; remote query results come back as JSON rows and are decoded the
//! same way. Schema inference runs over the full set of rows in a page.

use std::sync::Arc;

use arrow::array::new_null_array;
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::{ArrayWriter, ReaderBuilder};
use arrow::record_batch::RecordBatch;
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Decode JSON object rows into a single record batch with an inferred schema.
///
/// An empty row set produces an empty batch with an empty schema.
pub fn rows_to_batch(rows: &[Map<String, Value>]) -> Result<RecordBatch, CoreError> {
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }
    let values: Vec<Value> = rows.iter().map(|m| Value::Object(m.clone())).collect();
    let schema = infer_json_schema_from_iterator(values.iter().map(Ok))?;
    let mut decoder = ReaderBuilder::new(Arc::new(schema)).build_decoder()?;
    decoder.serialize(&values)?;
    decoder
        .flush()?
        .ok_or_else(|| CoreError::Backend("json decode produced no batch".to_string()))
}

/// Encode a batch back into JSON object rows.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Map<String, Value>>, CoreError> {
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(batch)?;
    writer.finish()?;
    let buf = writer.into_inner();
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<Map<String, Value>> = serde_json::from_slice(&buf)?;
    Ok(rows)
}

/// Project a batch onto a target schema: reorder matching columns, cast
/// where the types differ, and null-fill columns the batch does not carry.
pub fn align_batch(batch: &RecordBatch, target: SchemaRef) -> Result<RecordBatch, CoreError> {
    let mut columns = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        match batch.schema().index_of(field.name()) {
            Ok(idx) => {
                let column = batch.column(idx);
                if column.data_type() == field.data_type() {
                    columns.push(column.clone());
                } else {
                    columns.push(cast(column, field.data_type())?);
                }
            }
            Err(_) => columns.push(new_null_array(field.data_type(), batch.num_rows())),
        }
    }
    Ok(RecordBatch::try_new(target, columns)?)
}

/// Concatenate batches, aligning each onto the first batch's schema.
pub fn combine_batches(batches: &[RecordBatch]) -> Result<RecordBatch, CoreError> {
    let schema = batches
        .first()
        .map(|b| b.schema())
        .ok_or_else(|| CoreError::Backend("no batches to combine".to_string()))?;
    let aligned: Vec<RecordBatch> = batches
        .iter()
        .map(|b| align_batch(b, schema.clone()))
        .collect::<Result<_, _>>()?;
    Ok(concat_batches(&schema, &aligned)?)
}

/// Map an Arrow type onto a remote columnar-store column type.
pub fn column_type_for(data_type: &DataType) -> Result<&'static str, CoreError> {
    match data_type {
        DataType::Boolean => Ok("UInt8"),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => Ok("Int64"),
        DataType::Float16 | DataType::Float32 | DataType::Float64 => Ok("Float64"),
        DataType::Utf8 | DataType::LargeUtf8 => Ok("String"),
        DataType::Date32 | DataType::Date64 => Ok("Date"),
        DataType::Timestamp(_, _) => Ok("DateTime"),
        // No data present to guess from, store as string
        DataType::Null => Ok("String"),
        // Nested values are stored serialized
        DataType::List(_) | DataType::LargeList(_) | DataType::Struct(_) => Ok("String"),
        other => Err(CoreError::Backend(format!(
            "unsupported column type {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::Field;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_rows_round_trip() {
        let rows = vec![
            row(&[("id", json!(1)), ("name", json!("east"))]),
            row(&[("id", json!(2)), ("name", json!("west"))]),
        ];
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let back = batch_to_rows(&batch).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0]["name"], json!("east"));
        assert_eq!(back[1]["id"], json!(2));
    }

    #[test]
    fn test_empty_rows_make_empty_batch() {
        let batch = rows_to_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 0);
    }

    #[test]
    fn test_align_batch_null_fills_missing_column() {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)])),
            vec![Arc::new(Int64Array::from(vec![1, 2]))],
        )
        .unwrap();

        let target = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("id", DataType::Int64, true),
        ]));
        let aligned = align_batch(&batch, target).unwrap();
        assert_eq!(aligned.num_columns(), 2);
        assert_eq!(aligned.column(0).null_count(), 2);
    }

    #[test]
    fn test_combine_batches_with_differing_column_order() {
        let a = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("id", DataType::Int64, true),
                Field::new("name", DataType::Utf8, true),
            ])),
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(StringArray::from(vec!["east"])),
            ],
        )
        .unwrap();
        let b = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("name", DataType::Utf8, true),
                Field::new("id", DataType::Int64, true),
            ])),
            vec![
                Arc::new(StringArray::from(vec!["west"])),
                Arc::new(Int64Array::from(vec![2])),
            ],
        )
        .unwrap();

        let combined = combine_batches(&[a, b]).unwrap();
        assert_eq!(combined.num_rows(), 2);
        assert_eq!(combined.schema().field(0).name(), "id");
    }

    #[test]
    fn test_column_type_mapping() {
        assert_eq!(column_type_for(&DataType::Boolean).unwrap(), "UInt8");
        assert_eq!(column_type_for(&DataType::Utf8).unwrap(), "String");
        assert_eq!(column_type_for(&DataType::Null).unwrap(), "String");
    }
}
