//! Parquet episode files.
//!
//! One file per episode, written independently; episodes are never
//! accumulated in memory across saves.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, FixedSizeListArray, Float64Array, Int64Array};
use arrow::datatypes::Float32Type;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::buffer::EpisodeBuffer;
use crate::DatasetError;

/// Columns read back from an episode file, for verification and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeColumns {
    pub frame_indices: Vec<i64>,
    pub episode_indices: Vec<i64>,
    pub timestamps: Vec<f64>,
    pub states: Vec<Vec<f32>>,
    pub actions: Vec<Vec<f32>>,
}

fn vector_column(rows: &[Vec<f32>], dim: usize) -> FixedSizeListArray {
    FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        rows.iter().map(|row| {
            let mut padded: Vec<Option<f32>> = row.iter().copied().map(Some).collect();
            padded.resize(dim, Some(0.0));
            Some(padded)
        }),
        dim as i32,
    )
}

fn episode_batch(buffer: &EpisodeBuffer) -> Result<RecordBatch, DatasetError> {
    let n = buffer.size();
    let state_dim = buffer.states.first().map(Vec::len).unwrap_or(0);
    let action_dim = buffer.actions.first().map(Vec::len).unwrap_or(0);
    if state_dim == 0 || action_dim == 0 {
        return Err(DatasetError::Validation(format!(
            "episode {}: empty state or action vectors",
            buffer.episode_index
        )));
    }

    let frame_index: ArrayRef = Arc::new(Int64Array::from_iter_values(
        buffer.frame_indices.iter().map(|&v| v as i64),
    ));
    let episode_index: ArrayRef = Arc::new(Int64Array::from_iter_values(
        std::iter::repeat(buffer.episode_index as i64).take(n),
    ));
    let timestamp: ArrayRef = Arc::new(Float64Array::from_iter_values(
        buffer.timestamps.iter().copied(),
    ));
    let state: ArrayRef = Arc::new(vector_column(&buffer.states, state_dim));
    let action: ArrayRef = Arc::new(vector_column(&buffer.actions, action_dim));

    let batch = RecordBatch::try_from_iter(vec![
        ("frame_index", frame_index),
        ("episode_index", episode_index),
        ("timestamp", timestamp),
        ("observation.state", state),
        ("action", action),
    ])?;
    Ok(batch)
}

/// Writes the episode to its stable path, fsyncing before rename-free close.
pub fn write_episode(path: &Path, buffer: &EpisodeBuffer) -> Result<(), DatasetError> {
    buffer.check()?;
    let batch = episode_batch(buffer)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    let file = writer.into_inner()?;
    file.sync_all()?;

    tracing::info!(
        target: "telecap_proof",
        event = "episode_written",
        episode_index = buffer.episode_index,
        frames = buffer.size(),
        path = %path.display(),
        "columnar episode file written"
    );
    Ok(())
}

fn read_vector_column(batch: &RecordBatch, name: &str) -> Result<Vec<Vec<f32>>, DatasetError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| DatasetError::Validation(format!("column {name} missing")))?;
    let list = column
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .ok_or_else(|| DatasetError::Validation(format!("column {name} has unexpected type")))?;
    let mut rows = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        let values = list.value(i);
        let floats = values
            .as_any()
            .downcast_ref::<arrow::array::Float32Array>()
            .ok_or_else(|| {
                DatasetError::Validation(format!("column {name} items are not float32"))
            })?;
        rows.push(floats.values().to_vec());
    }
    Ok(rows)
}

/// Reads an episode file back into plain columns.
pub fn read_episode(path: &Path) -> Result<EpisodeColumns, DatasetError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut frame_indices = Vec::new();
    let mut episode_indices = Vec::new();
    let mut timestamps = Vec::new();
    let mut states = Vec::new();
    let mut actions = Vec::new();

    for batch in reader {
        let batch = batch?;
        let ints = |name: &str| -> Result<Vec<i64>, DatasetError> {
            let column = batch
                .column_by_name(name)
                .ok_or_else(|| DatasetError::Validation(format!("column {name} missing")))?;
            let array = column
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| {
                    DatasetError::Validation(format!("column {name} has unexpected type"))
                })?;
            Ok(array.values().to_vec())
        };
        frame_indices.extend(ints("frame_index")?);
        episode_indices.extend(ints("episode_index")?);

        let ts = batch
            .column_by_name("timestamp")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>().cloned())
            .ok_or_else(|| DatasetError::Validation("timestamp column missing".to_string()))?;
        timestamps.extend(ts.values().iter().copied());

        states.extend(read_vector_column(&batch, "observation.state")?);
        actions.extend(read_vector_column(&batch, "action")?);
    }

    Ok(EpisodeColumns {
        frame_indices,
        episode_indices,
        timestamps,
        states,
        actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use telecap_core::types::CameraName;

    fn temp_file(test_name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "telecap-columnar-{}-{}-{}.parquet",
            test_name,
            std::process::id(),
            telecap_observe::time::unix_time_ms()
        ));
        path
    }

    fn filled_buffer(frames: u64) -> EpisodeBuffer {
        let cams = vec![CameraName("top".to_string())];
        let mut buf = EpisodeBuffer::new(2, "stack", 30, &cams);
        for i in 0..frames {
            let mut paths = BTreeMap::new();
            paths.insert(
                CameraName("top".to_string()),
                format!("frame_{i:06}.png"),
            );
            buf.append(
                vec![i as f32, -(i as f32), 0.5],
                vec![i as f32 * 2.0, 0.0, 1.0],
                paths,
            );
        }
        buf
    }

    #[test]
    fn roundtrip_preserves_all_columns() -> anyhow::Result<()> {
        let path = temp_file("roundtrip");
        let buf = filled_buffer(25);
        write_episode(&path, &buf)?;

        let cols = read_episode(&path)?;
        assert_eq!(cols.frame_indices.len(), 25);
        assert_eq!(cols.episode_indices, vec![2i64; 25]);
        assert_eq!(cols.timestamps, buf.timestamps);
        assert_eq!(cols.states, buf.states);
        assert_eq!(cols.actions, buf.actions);

        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn zero_frame_episode_is_rejected_not_written() {
        let path = temp_file("empty");
        let cams = vec![CameraName("top".to_string())];
        let buf = EpisodeBuffer::new(0, "stack", 30, &cams);
        let err = write_episode(&path, &buf).unwrap_err();
        assert!(matches!(err, DatasetError::Validation(_)));
        assert!(!path.exists());
    }
}
