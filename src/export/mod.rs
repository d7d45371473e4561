//! Dataset export of crawled tracks.
//!
//! Reads every stored record in pages and writes a Parquet file for
//! offline analysis.

pub mod parquet_writer;

pub use parquet_writer::{
    export_tracks, read_track_rows, rows_to_record_batch, track_schema, ExportSummary, TrackRow,
};
