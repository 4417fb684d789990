//! Parquet encoding/decoding of columnar partitions.
//!
//! Physical mapping:
//!
//! | Semantic type | Arrow type |
//! |---------------|------------|
//! | numeric       | `Float64`  |
//! | categorical   | `Utf8`     |
//! | date          | `Date32`   |
//! | identifier    | `Utf8`     |
//!
//! Categorical and identifier share a physical type, so the semantic type is
//! kept in the field metadata under [`TYPE_METADATA_KEY`]. Files written by
//! other tools without that key decode by physical type (`Utf8` as
//! categorical, except the `grid_id` column).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array as _, ArrayRef, Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::column::{Column, ColumnData, ColumnType, ColumnarPartition, GRID_ID};
use crate::error::{CatalogError, Result};

/// Field metadata key carrying the semantic column type.
pub const TYPE_METADATA_KEY: &str = "tessera.type";

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("tessera-catalog".to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Numeric => DataType::Float64,
        ColumnType::Categorical | ColumnType::Identifier => DataType::Utf8,
        ColumnType::Date => DataType::Date32,
    }
}

fn to_epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn from_epoch_days(days: i32) -> Result<NaiveDate> {
    days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .ok_or_else(|| CatalogError::Parquet {
            message: format!("date out of range: {days} days since epoch"),
        })
}

fn partition_schema(partition: &ColumnarPartition) -> Arc<Schema> {
    let fields: Vec<Field> = partition
        .columns()
        .iter()
        .map(|c| {
            Field::new(c.name(), arrow_type(c.column_type()), true).with_metadata(HashMap::from([(
                TYPE_METADATA_KEY.to_string(),
                c.column_type().as_label().to_string(),
            )]))
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn to_array(data: &ColumnData) -> ArrayRef {
    match data {
        ColumnData::Numeric(v) => Arc::new(Float64Array::from(v.clone())),
        ColumnData::Categorical(v) | ColumnData::Identifier(v) => Arc::new(StringArray::from(
            v.iter().map(Option::as_deref).collect::<Vec<_>>(),
        )),
        ColumnData::Date(v) => Arc::new(Date32Array::from(
            v.iter().map(|d| d.map(to_epoch_days)).collect::<Vec<_>>(),
        )),
    }
}

/// Encodes a partition as a single-row-group Parquet file.
///
/// # Errors
///
/// Returns an error if the record batch cannot be built or the Parquet write
/// fails.
pub fn write_partition(partition: &ColumnarPartition) -> Result<Bytes> {
    let schema = partition_schema(partition);
    let arrays: Vec<ArrayRef> = partition.columns().iter().map(|c| to_array(c.data())).collect();

    let batch = RecordBatch::try_new(schema.clone(), arrays).map_err(|e| CatalogError::Parquet {
        message: format!("record batch build failed: {e}"),
    })?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer =
        ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties())).map_err(|e| {
            CatalogError::Parquet {
                message: format!("parquet writer init failed: {e}"),
            }
        })?;
    writer.write(&batch).map_err(|e| CatalogError::Parquet {
        message: format!("parquet write failed: {e}"),
    })?;
    writer.close().map_err(|e| CatalogError::Parquet {
        message: format!("parquet close failed: {e}"),
    })?;
    Ok(Bytes::from(cursor.into_inner()))
}

fn semantic_type(field: &Field) -> Result<ColumnType> {
    if let Some(label) = field.metadata().get(TYPE_METADATA_KEY) {
        let ty = ColumnType::from_label(label).ok_or_else(|| CatalogError::Parquet {
            message: format!("column '{}' has unknown type label '{label}'", field.name()),
        })?;
        if arrow_type(ty) != *field.data_type() {
            return Err(CatalogError::Parquet {
                message: format!(
                    "column '{}' is labelled {ty} but stored as {}",
                    field.name(),
                    field.data_type()
                ),
            });
        }
        return Ok(ty);
    }

    match field.data_type() {
        DataType::Float64 => Ok(ColumnType::Numeric),
        DataType::Date32 => Ok(ColumnType::Date),
        DataType::Utf8 if field.name() == GRID_ID => Ok(ColumnType::Identifier),
        DataType::Utf8 => Ok(ColumnType::Categorical),
        other => Err(CatalogError::Parquet {
            message: format!("column '{}' has unsupported type {other}", field.name()),
        }),
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CatalogError::Parquet {
            message: format!("column '{name}' has unexpected array type"),
        })
}

fn append(data: &mut ColumnData, array: &ArrayRef, name: &str) -> Result<()> {
    match data {
        ColumnData::Numeric(out) => {
            let arr = downcast::<Float64Array>(array, name)?;
            out.extend((0..arr.len()).map(|i| (!arr.is_null(i)).then(|| arr.value(i))));
        }
        ColumnData::Categorical(out) | ColumnData::Identifier(out) => {
            let arr = downcast::<StringArray>(array, name)?;
            out.extend((0..arr.len()).map(|i| (!arr.is_null(i)).then(|| arr.value(i).to_string())));
        }
        ColumnData::Date(out) => {
            let arr = downcast::<Date32Array>(array, name)?;
            for i in 0..arr.len() {
                out.push(if arr.is_null(i) {
                    None
                } else {
                    Some(from_epoch_days(arr.value(i))?)
                });
            }
        }
    }
    Ok(())
}

/// Decodes a Parquet file written by [`write_partition`].
///
/// # Errors
///
/// Returns `Parquet` if the bytes are not a readable Parquet file or a column
/// has an unsupported type, and the partition validation errors of
/// [`ColumnarPartition::new`] if the decoded columns are inconsistent.
pub fn read_partition(bytes: &Bytes) -> Result<ColumnarPartition> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(bytes.clone()).map_err(|e| CatalogError::Parquet {
            message: format!("parquet reader init failed: {e}"),
        })?;
    let schema = builder.schema().clone();

    let mut columns: Vec<(String, ColumnData)> = schema
        .fields()
        .iter()
        .map(|f| Ok((f.name().clone(), ColumnData::nulls(semantic_type(f)?, 0))))
        .collect::<Result<_>>()?;

    let reader = builder.build().map_err(|e| CatalogError::Parquet {
        message: format!("parquet reader build failed: {e}"),
    })?;
    for batch in reader {
        let batch = batch.map_err(|e| CatalogError::Parquet {
            message: format!("parquet read batch failed: {e}"),
        })?;
        for (idx, (name, data)) in columns.iter_mut().enumerate() {
            append(data, batch.column(idx), name)?;
        }
    }

    ColumnarPartition::new(
        columns
            .into_iter()
            .map(|(name, data)| Column::new(name, data))
            .collect(),
    )
}
