//! Parquet export of crawled tracks.
//!
//! One row per track that has audio features: identity, popularity and the
//! seven perceptual features. Records are streamed page by page from a
//! [`RecordSource`], each page becoming one row group.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Array, ArrayRef, Float32Array, Float32Builder, StringArray, StringBuilder, UInt32Array, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};

use crate::catalog::TrackRecord;
use crate::error::ExportError;
use crate::storage::RecordSource;

/// One exported row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRow {
    pub track_id: String,
    pub name: String,
    pub popularity: u32,
    pub acousticness: f32,
    pub danceability: f32,
    pub energy: f32,
    pub instrumentalness: f32,
    pub liveness: f32,
    pub speechiness: f32,
    pub valence: f32,
}

impl TrackRow {
    /// `None` when the track has no audio features.
    pub fn from_record(record: &TrackRecord) -> Option<Self> {
        let features = record.features.as_ref()?;
        Some(Self {
            track_id: record.track.id.clone(),
            name: record.track.name.clone(),
            popularity: record.track.popularity,
            acousticness: features.acousticness,
            danceability: features.danceability,
            energy: features.energy,
            instrumentalness: features.instrumentalness,
            liveness: features.liveness,
            speechiness: features.speechiness,
            valence: features.valence,
        })
    }
}

/// Outcome of an export run.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub rows_written: usize,
    /// Records without audio features.
    pub skipped: usize,
    pub duration: Duration,
}

const FEATURE_COLUMNS: [&str; 7] = [
    "acousticness",
    "danceability",
    "energy",
    "instrumentalness",
    "liveness",
    "speechiness",
    "valence",
];

pub fn track_schema() -> Schema {
    let mut fields = vec![
        Field::new("track_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("popularity", DataType::UInt32, false),
    ];
    fields.extend(FEATURE_COLUMNS.iter().map(|name| Field::new(*name, DataType::Float32, false)));
    Schema::new(fields)
}

/// Convert a batch of rows into an Arrow RecordBatch.
pub fn rows_to_record_batch(rows: &[TrackRow]) -> Result<RecordBatch, ExportError> {
    let schema = Arc::new(track_schema());

    let mut track_id = StringBuilder::new();
    let mut name = StringBuilder::new();
    let mut popularity = UInt32Builder::new();
    let mut features: Vec<Float32Builder> = FEATURE_COLUMNS.iter().map(|_| Float32Builder::new()).collect();

    for row in rows {
        track_id.append_value(&row.track_id);
        name.append_value(&row.name);
        popularity.append_value(row.popularity);

        let values = [
            row.acousticness,
            row.danceability,
            row.energy,
            row.instrumentalness,
            row.liveness,
            row.speechiness,
            row.valence,
        ];
        for (builder, value) in features.iter_mut().zip(values) {
            builder.append_value(value);
        }
    }

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(track_id.finish()),
        Arc::new(name.finish()),
        Arc::new(popularity.finish()),
    ];
    columns.extend(features.iter_mut().map(|b| Arc::new(b.finish()) as ArrayRef));

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn decode_page(page: Vec<(String, String)>, summary: &mut ExportSummary) -> Result<Vec<TrackRow>, ExportError> {
    let mut rows = Vec::with_capacity(page.len());
    for (key, raw) in page {
        let record: TrackRecord =
            serde_json::from_str(&raw).map_err(|source| ExportError::MalformedRecord { key: key.clone(), source })?;

        match TrackRow::from_record(&record) {
            Some(row) => rows.push(row),
            None => {
                warn!(key = %key, "track has no audio features, skipping");
                summary.skipped += 1;
            }
        }
    }
    Ok(rows)
}

/// Streams every record from `source` into a ZSTD-compressed Parquet file.
///
/// # Errors
///
/// Fails on store errors, undecodable records and write failures. A
/// partially written file is left behind on error.
pub async fn export_tracks<S>(source: &mut S, output_path: &Path) -> Result<ExportSummary, ExportError>
where
    S: RecordSource + ?Sized,
{
    let started = Instant::now();

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(output_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, Arc::new(track_schema()), Some(props))?;

    let mut summary = ExportSummary::default();
    while let Some(page) = source.next_page().await? {
        let rows = decode_page(page, &mut summary)?;
        if rows.is_empty() {
            continue;
        }

        let batch = rows_to_record_batch(&rows)?;
        writer.write(&batch)?;
        writer.flush()?;
        summary.rows_written += rows.len();
        debug!(rows = rows.len(), total = summary.rows_written, "row group written");
    }
    writer.close()?;

    summary.duration = started.elapsed();
    info!(
        path = %output_path.display(),
        rows = summary.rows_written,
        skipped = summary.skipped,
        duration_ms = summary.duration.as_millis() as u64,
        "Parquet file written"
    );

    Ok(summary)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, ExportError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| ExportError::Arrow(ArrowError::SchemaError(format!("missing column '{}'", name))))
}

/// Read rows back from an exported file.
pub fn read_track_rows(input_path: &Path) -> Result<Vec<TrackRow>, ExportError> {
    let file = File::open(input_path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let num_rows = batch.num_rows();

        let ids = column::<StringArray>(&batch, "track_id")?;
        let names = column::<StringArray>(&batch, "name")?;
        let popularity = column::<UInt32Array>(&batch, "popularity")?;
        let features = FEATURE_COLUMNS
            .iter()
            .map(|&name| column::<Float32Array>(&batch, name))
            .collect::<Result<Vec<_>, _>>()?;

        for i in 0..num_rows {
            if ids.is_null(i) {
                continue;
            }
            rows.push(TrackRow {
                track_id: ids.value(i).to_string(),
                name: names.value(i).to_string(),
                popularity: popularity.value(i),
                acousticness: features[0].value(i),
                danceability: features[1].value(i),
                energy: features[2].value(i),
                instrumentalness: features[3].value(i),
                liveness: features[4].value(i),
                speechiness: features[5].value(i),
                valence: features[6].value(i),
            });
        }
    }

    Ok(rows)
}
