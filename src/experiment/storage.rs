//! Persistence of finished measurement series.
//!
//! The runner hands each experiment's series to a [`SeriesSink`] together with
//! the sequence output directory. `CsvSink` writes
//! `<directory>/<experiment>.csv` with a `seconds` column followed by the
//! experiment's fields.

use super::MeasurementSeries;
use crate::error::AppResult;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

#[cfg(feature = "storage_csv")]
use crate::error::LabError;

/// Receives one series per finished experiment.
pub trait SeriesSink: Send + Sync {
    fn persist(&self, directory: &Path, experiment: &str, series: &MeasurementSeries) -> AppResult<()>;
}

/// CSV writer, one file per experiment.
#[cfg(feature = "storage_csv")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvSink;

#[cfg(feature = "storage_csv")]
impl SeriesSink for CsvSink {
    fn persist(&self, directory: &Path, experiment: &str, series: &MeasurementSeries) -> AppResult<()> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(format!("{experiment}.csv"));
        let csv_err = |e: csv::Error| {
            LabError::Io(std::io::Error::other(format!("{}: {}", path.display(), e)))
        };

        let mut writer = csv::Writer::from_path(&path).map_err(csv_err)?;

        let mut header = Vec::with_capacity(series.fields().len() + 1);
        header.push("seconds");
        header.extend(series.fields().iter().map(String::as_str));
        writer.write_record(&header).map_err(csv_err)?;

        for record in series.records() {
            let row = std::iter::once(record.elapsed_seconds)
                .chain(record.values.iter().copied())
                .map(|v| format!("{v:?}"));
            writer.write_record(row).map_err(csv_err)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// A series captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSeries {
    pub directory: PathBuf,
    pub experiment: String,
    pub series: MeasurementSeries,
}

/// Keeps every series in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    stored: Arc<Mutex<Vec<StoredSeries>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Vec<StoredSeries> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SeriesSink for MemorySink {
    fn persist(&self, directory: &Path, experiment: &str, series: &MeasurementSeries) -> AppResult<()> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredSeries {
                directory: directory.to_path_buf(),
                experiment: experiment.to_string(),
                series: series.clone(),
            });
        Ok(())
    }
}

/// Drops every series with a warning. Used when no storage backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl SeriesSink for DiscardSink {
    fn persist(&self, _directory: &Path, experiment: &str, series: &MeasurementSeries) -> AppResult<()> {
        warn!(experiment, records = series.len(), "no storage backend enabled; series discarded");
        Ok(())
    }
}

/// CSV when `storage_csv` is enabled, otherwise [`DiscardSink`].
pub fn default_sink() -> Arc<dyn SeriesSink> {
    #[cfg(feature = "storage_csv")]
    {
        Arc::new(CsvSink)
    }
    #[cfg(not(feature = "storage_csv"))]
    {
        Arc::new(DiscardSink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_series() -> MeasurementSeries {
        let mut series = MeasurementSeries::new(vec!["voltage".into(), "current".into()]);
        series.push(0.0, vec![8.0, 1.6]).unwrap();
        series.push(0.5, vec![8.0, 1.5]).unwrap();
        series
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_has_seconds_column_first() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("warmup");

        CsvSink.persist(&target, "000", &sample_series()).unwrap();

        let text = std::fs::read_to_string(target.join("000.csv")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines, ["seconds,voltage,current", "0.0,8.0,1.6", "0.5,8.0,1.5"]);
    }

    #[test]
    fn memory_sink_keeps_directory_and_name() {
        let sink = MemorySink::new();
        sink.persist(Path::new("out/seq"), "e", &sample_series()).unwrap();

        let stored = sink.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].directory, PathBuf::from("out/seq"));
        assert_eq!(stored[0].experiment, "e");
        assert_eq!(stored[0].series.len(), 2);
    }
}
