//! Save-as-you-go output of completed line scans.
//!
//! The grid sweep hands every completed line to a [`SweepSink`] before moving
//! on, so an aborted sweep keeps everything measured up to the failure.
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::metrolab::{format_range, MetrolabProbe};
use crate::scan::{GridCell, LineScanResult};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::Path;

/// Receives completed lines in sweep order.
#[async_trait]
pub trait SweepSink: Send {
    /// Persist one line measured at `cell`.
    async fn write_line(&mut self, cell: &GridCell, line: &LineScanResult) -> AppResult<()>;

    /// Flush and close.
    async fn finish(&mut self) -> AppResult<()>;
}

/// Descriptive header written ahead of the data.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepMetadata {
    /// When the sweep started
    pub started: DateTime<Local>,
    /// Magnet under test
    pub magnet: String,
    /// Excitation current in amperes
    pub current_a: f64,
    /// Probe identification
    pub probe: String,
    /// Readings averaged per sample
    pub averages: u32,
    /// Probe range, or "auto"
    pub probe_range: String,
    /// Free-form comment
    pub comment: String,
    /// Axes held at one position for the whole sweep
    pub fixed: Vec<(String, f64)>,
}

impl SweepMetadata {
    /// Header for a sweep configured by `settings`, starting now.
    pub fn from_settings(settings: &Settings) -> Self {
        let probe = &settings.probe;
        Self {
            started: Local::now(),
            magnet: settings.metadata.magnet.clone(),
            current_a: settings.metadata.current_a,
            probe: format!("THM1176 at {}", probe.resource),
            averages: probe.averages,
            probe_range: if probe.auto_range {
                "auto".to_string()
            } else {
                format!("{} T", probe.range)
            },
            comment: settings.metadata.comment.clone(),
            fixed: settings
                .sweep
                .fixed
                .iter()
                .map(|f| {
                    let name = settings
                        .resolve_axis(&f.axis)
                        .map(str::to_string)
                        .unwrap_or_else(|_| f.axis.clone());
                    (name, f.position)
                })
                .collect(),
        }
    }

    /// Describe the connected probe as it reports itself rather than as
    /// configured.
    pub async fn describe_probe(&mut self, probe: &MetrolabProbe) {
        self.probe = probe.identity().await.to_string();
        self.averages = probe.averages().await;
        self.probe_range = match probe.range().await {
            (true, _) => "auto".to_string(),
            (false, range) => format!("{} {}", format_range(range), probe.ranges().await.1),
        };
    }

    /// `(name, value)` header rows.
    pub fn rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            (
                "Date/time".to_string(),
                self.started.format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            ("Magnet under test".to_string(), self.magnet.clone()),
            ("Magnet current [A]".to_string(), self.current_a.to_string()),
            ("Probe".to_string(), self.probe.clone()),
            ("Averages".to_string(), self.averages.to_string()),
            ("Probe range".to_string(), self.probe_range.clone()),
            ("Comment".to_string(), self.comment.clone()),
        ];
        rows.extend(
            self.fixed
                .iter()
                .map(|(axis, position)| (format!("Fixed {}", axis), position.to_string())),
        );
        rows
    }
}

/// Column names for lines measured at `cell`.
pub fn column_header(cell: &GridCell, line: &LineScanResult) -> Vec<String> {
    let mut header = vec![format!("{} [{}]", line.axis, line.units)];
    header.extend(
        cell.coords
            .iter()
            .map(|c| format!("{} [{}]", c.axis, c.units)),
    );
    header.extend(
        ["Bx", "By", "Bz"]
            .iter()
            .map(|b| format!("{} [{}]", b, line.field_units)),
    );
    header
}

/// One formatted row per sample, values at three decimals.
pub fn data_rows(cell: &GridCell, line: &LineScanResult) -> Vec<Vec<String>> {
    line.samples()
        .map(|(position, field)| {
            std::iter::once(position.value)
                .chain(cell.coords.iter().map(|c| c.value))
                .chain(field.components())
                .map(|v| format!("{:.3}", v))
                .collect()
        })
        .collect()
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;
    use tracing::info;

    /// Writes the sweep to one CSV file.
    ///
    /// Metadata lines are prefixed with `# `; the column header is written
    /// with the first line, once the axis and field units are known.
    pub struct CsvExporter {
        path: PathBuf,
        writer: Option<csv::Writer<File>>,
        header_written: bool,
        lines: usize,
    }

    impl CsvExporter {
        /// Create the file and write the metadata header.
        pub fn create<P: AsRef<Path>>(path: P, metadata: &SweepMetadata) -> AppResult<Self> {
            let path = path.as_ref().to_path_buf();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&path)?;
            for (name, value) in metadata.rows() {
                writeln!(file, "# {}: {}", name, value)?;
            }

            info!("CSV export initialized at '{}'.", path.display());
            Ok(Self {
                path,
                writer: Some(csv::Writer::from_writer(file)),
                header_written: false,
                lines: 0,
            })
        }

        /// Output path.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Append `# name: value` lines to a finished export, e.g. results
        /// derived from the data.
        pub fn append_notes(&self, rows: &[(String, String)]) -> AppResult<()> {
            if self.writer.is_some() {
                return Err(DaqError::Io(std::io::Error::other(format!(
                    "CSV export '{}' is still open",
                    self.path.display()
                ))));
            }
            let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
            for (name, value) in rows {
                writeln!(file, "# {}: {}", name, value)?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SweepSink for CsvExporter {
        async fn write_line(&mut self, cell: &GridCell, line: &LineScanResult) -> AppResult<()> {
            let writer = self.writer.as_mut().ok_or_else(|| {
                DaqError::Io(std::io::Error::other(format!(
                    "CSV export '{}' already finished",
                    self.path.display()
                )))
            })?;
            if !self.header_written {
                writer
                    .write_record(column_header(cell, line))
                    .map_err(std::io::Error::from)?;
                self.header_written = true;
            }
            for row in data_rows(cell, line) {
                writer.write_record(&row).map_err(std::io::Error::from)?;
            }
            writer.flush()?;
            self.lines += 1;
            Ok(())
        }

        async fn finish(&mut self) -> AppResult<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
                info!(lines = self.lines, "CSV export '{}' closed.", self.path.display());
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// CSV export is compiled out.
    pub struct CsvExporter;

    impl CsvExporter {
        /// Always fails: built without `storage_csv`.
        pub fn create<P: AsRef<Path>>(path: P, _metadata: &SweepMetadata) -> AppResult<Self> {
            Err(DaqError::Configuration(format!(
                "cannot write '{}': built without the storage_csv feature",
                path.as_ref().display()
            )))
        }

        /// Always fails: built without `storage_csv`.
        pub fn append_notes(&self, _rows: &[(String, String)]) -> AppResult<()> {
            Err(DaqError::Configuration("storage_csv".to_string()))
        }
    }

    #[async_trait]
    impl SweepSink for CsvExporter {
        async fn write_line(&mut self, _cell: &GridCell, _line: &LineScanResult) -> AppResult<()> {
            Err(DaqError::Configuration("storage_csv".to_string()))
        }

        async fn finish(&mut self) -> AppResult<()> {
            Ok(())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvExporter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvExporter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AxisPosition, FieldVector};
    use crate::scan::{CellCoordinate, ScanMode};

    fn line() -> LineScanResult {
        LineScanResult {
            axis: "hp z".to_string(),
            units: "mm".to_string(),
            field_units: "MT".to_string(),
            positions: vec![
                AxisPosition::new(-1.0, 1000.0),
                AxisPosition::new(-0.5, 1000.0),
            ],
            fields: vec![
                FieldVector::new(0.01234, -0.5, 49.99951),
                FieldVector::new(0.0, 0.0, 50.0),
            ],
            mode: ScanMode::OnTheFly,
            attempts: 1,
        }
    }

    fn cell() -> GridCell {
        GridCell {
            coords: vec![CellCoordinate {
                axis: "hp x".to_string(),
                units: "mm".to_string(),
                value: 0.5,
            }],
        }
    }

    #[test]
    fn test_header_and_rows() {
        assert_eq!(
            column_header(&cell(), &line()),
            vec!["hp z [mm]", "hp x [mm]", "Bx [MT]", "By [MT]", "Bz [MT]"]
        );
        let rows = data_rows(&cell(), &line());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["-1.000", "0.500", "0.012", "-0.500", "50.000"]);
    }

    #[test]
    fn test_metadata_rows_include_fixed_axes() {
        let metadata = SweepMetadata::from_settings(&Settings::default());
        let rows = metadata.rows();
        assert_eq!(rows[0].0, "Date/time");
        assert!(rows.contains(&("Fixed hp y".to_string(), "0".to_string())));
        assert!(rows.contains(&("Probe range".to_string(), "0.1 T".to_string())));
    }

    #[tokio::test]
    async fn test_metadata_describes_the_connected_probe() {
        let rig = crate::hardware::sim::SimRig::build(&Settings::default())
            .await
            .unwrap();
        let mut metadata = SweepMetadata::from_settings(&Settings::default());
        metadata.describe_probe(&rig.instrument).await;

        assert_eq!(metadata.probe, "Metrolab Technology SA THM1176-MF S/N SIM0001");
        assert_eq!(metadata.averages, 100);
        assert_eq!(metadata.probe_range, "0.1 T");

        rig.instrument.set_range(None).await.unwrap();
        metadata.describe_probe(&rig.instrument).await;
        assert_eq!(metadata.probe_range, "auto");
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_notes_appended_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.csv");
        let metadata = SweepMetadata::from_settings(&Settings::default());
        let mut exporter = CsvExporter::create(&path, &metadata).unwrap();
        exporter.write_line(&cell(), &line()).await.unwrap();

        let notes = vec![("Peak position [mm]".to_string(), "0.125".to_string())];
        assert!(exporter.append_notes(&notes).is_err());
        exporter.finish().await.unwrap();
        exporter.append_notes(&notes).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("# Peak position [mm]: 0.125\n"));
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 3);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_written_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps").join("map.csv");
        let metadata = SweepMetadata::from_settings(&Settings::default());
        let mut exporter = CsvExporter::create(&path, &metadata).unwrap();

        exporter.write_line(&cell(), &line()).await.unwrap();
        let after_first = std::fs::read_to_string(&path).unwrap();
        assert!(after_first.contains("hp z [mm],hp x [mm],Bx [MT],By [MT],Bz [MT]"));
        assert!(after_first.contains("-0.500,0.500,0.000,0.000,50.000"));

        exporter.write_line(&cell(), &line()).await.unwrap();
        exporter.finish().await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Date/time: "));
        assert_eq!(text.matches("Bx [MT]").count(), 1);
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 5);
        assert!(exporter.write_line(&cell(), &line()).await.is_err());
    }
}
