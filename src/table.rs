//! Dataset x algorithm-variant metric tables and their delimited-text form.

use crate::SentinelMode;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// Header of the row-label column.
pub const ROW_LABEL: &str = "Dataset";

/// One table cell. A cell that was never set is missing, which is distinct
/// from both a measured value and a failed extraction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum Cell {
    Value(f64),
    Invalid,
}

#[derive(Clone, Debug)]
struct Row {
    dataset: String,
    cells: HashMap<String, Cell>,
}

#[derive(Clone, Debug)]
pub struct MetricTable {
    name: String,
    rows: Vec<Row>,
    columns: Vec<String>,
}

impl MetricTable {
    /// Empty table whose rows follow `datasets` in order.
    pub fn new<I, S>(name: &str, datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            rows: datasets
                .into_iter()
                .map(|d| Row {
                    dataset: d.into(),
                    cells: HashMap::new(),
                })
                .collect(),
            columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.dataset.as_str())
    }

    /// Columns in first-seen order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Set a cell; the column is added on first use. Returns false when the
    /// dataset is not a row of this table.
    pub fn set(&mut self, dataset: &str, column: &str, cell: Cell) -> bool {
        let Some(row) = self.rows.iter_mut().find(|r| r.dataset == dataset) else {
            warn!(table = %self.name, %dataset, %column, "cell for unknown row dropped");
            return false;
        };
        row.cells.insert(column.to_string(), cell);
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
        true
    }

    pub fn get(&self, dataset: &str, column: &str) -> Option<Cell> {
        self.rows
            .iter()
            .find(|r| r.dataset == dataset)
            .and_then(|r| r.cells.get(column).copied())
    }

    /// `(dataset, column)` pairs with no cell.
    pub fn missing_cells(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for row in &self.rows {
            for col in &self.columns {
                if !row.cells.contains_key(col) {
                    out.push((row.dataset.clone(), col.clone()));
                }
            }
        }
        out
    }

    pub fn invalid_count(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|r| r.cells.values())
            .filter(|c| matches!(c, Cell::Invalid))
            .count()
    }

    fn write_records<W: io::Write>(
        &self,
        wtr: &mut csv::Writer<W>,
        mode: SentinelMode,
    ) -> csv::Result<()> {
        let header = std::iter::once(ROW_LABEL).chain(self.columns.iter().map(String::as_str));
        wtr.write_record(header)?;
        for row in &self.rows {
            let mut fields = vec![row.dataset.clone()];
            for col in &self.columns {
                fields.push(match row.cells.get(col) {
                    Some(Cell::Value(v)) => format_value(*v),
                    Some(Cell::Invalid) => match mode {
                        SentinelMode::Explicit => "NaN".to_string(),
                        SentinelMode::Zero => "0".to_string(),
                    },
                    None => String::new(),
                });
            }
            wtr.write_record(&fields)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv(&self, mode: SentinelMode) -> io::Result<String> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        self.write_records(&mut wtr, mode).map_err(csv_to_io)?;
        let bytes = wtr
            .into_inner()
            .map_err(|e| io::Error::new(e.error().kind(), e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| invalid_data(e.to_string()))
    }

    /// Write the table, warning about every missing cell.
    pub fn write_csv(&self, path: &Path, mode: SentinelMode) -> io::Result<()> {
        for (dataset, column) in self.missing_cells() {
            warn!(table = %self.name, %dataset, %column, "missing cell");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::Writer::from_path(path).map_err(csv_to_io)?;
        self.write_records(&mut wtr, mode).map_err(csv_to_io)
    }

    /// Parse a table written by `to_csv`. Empty fields are missing cells and
    /// `NaN` fields are invalid cells.
    pub fn from_csv(name: &str, text: &str) -> io::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(text.as_bytes());
        let header = rdr.headers().map_err(csv_to_io)?.clone();
        if header.is_empty() {
            return Err(invalid_data("empty table"));
        }
        if header.get(0) != Some(ROW_LABEL) {
            return Err(invalid_data(format!("first column must be {ROW_LABEL:?}")));
        }
        let columns: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

        let mut table = MetricTable::new(name, Vec::<String>::new());
        for record in rdr.records() {
            let record = record.map_err(csv_to_io)?;
            let dataset = record.get(0).unwrap_or_default().to_string();
            table.rows.push(Row {
                dataset: dataset.clone(),
                cells: HashMap::new(),
            });
            for (col, raw) in columns.iter().zip(record.iter().skip(1)) {
                let cell = match raw.trim() {
                    "" => continue,
                    "NaN" | "nan" => Cell::Invalid,
                    v => Cell::Value(v.parse().map_err(|_| {
                        invalid_data(format!("bad value {v:?} in column {col:?}"))
                    })?),
                };
                table.set(&dataset, col, cell);
            }
        }
        for col in &columns {
            if !table.columns.contains(col) {
                table.columns.push(col.clone());
            }
        }
        Ok(table)
    }

    pub fn read_csv(path: &Path) -> io::Result<Self> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_csv(&name, &fs::read_to_string(path)?)
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Malformed text is `InvalidData`; real I/O failures keep their kind.
fn csv_to_io(e: csv::Error) -> io::Error {
    if !e.is_io_error() {
        return invalid_data(e.to_string());
    }
    match e.into_kind() {
        csv::ErrorKind::Io(err) => err,
        other => invalid_data(format!("{other:?}")),
    }
}

fn format_value(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}
