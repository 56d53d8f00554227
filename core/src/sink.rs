//! Output sinks: where each category's record stream ends up.
//!
//! A sink receives one header row, then rows in arrival order, then a
//! single `finish`. Sinks are driven from blocking consumer threads, so
//! plain `std::io` writers are fine here.

use crate::{
    dispatch::Category,
    error::{CohortError, CohortResult},
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

pub trait RecordSink: Send {
    fn write_header(&mut self, fields: &[String]) -> CohortResult<()>;
    fn write_record(&mut self, fields: &[String]) -> CohortResult<()>;
    /// Flush buffered rows. Called once after the last record.
    fn finish(&mut self) -> CohortResult<()>;
}

/// Opens one sink per output category.
pub trait SinkFactory: Send + Sync {
    fn open(&self, category: Category) -> CohortResult<Box<dyn RecordSink>>;
}

/// Comma-separated rows; fields holding a comma, quote or newline are
/// quoted with inner quotes doubled.
pub struct CsvSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_row(&mut self, fields: &[String]) -> CohortResult<()> {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.writer.write_all(b",")?;
            }
            self.writer.write_all(escape_csv(field).as_bytes())?;
        }
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> RecordSink for CsvSink<W> {
    fn write_header(&mut self, fields: &[String]) -> CohortResult<()> {
        self.write_row(fields)
    }

    fn write_record(&mut self, fields: &[String]) -> CohortResult<()> {
        self.write_row(fields)
    }

    fn finish(&mut self) -> CohortResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Escape a string for CSV output
pub fn escape_csv(s: &str) -> std::borrow::Cow<'_, str> {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\"")).into()
    } else {
        s.into()
    }
}

/// Writes `<out_dir>/<category>.csv`.
#[derive(Debug, Clone)]
pub struct CsvSinkFactory {
    out_dir: PathBuf,
}

impl CsvSinkFactory {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn path_for(&self, category: Category) -> PathBuf {
        self.out_dir.join(format!("{}.csv", category.name()))
    }
}

impl SinkFactory for CsvSinkFactory {
    fn open(&self, category: Category) -> CohortResult<Box<dyn RecordSink>> {
        let path = self.path_for(category);
        let file = File::create(&path).map_err(|e| {
            CohortError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create {}: {e}", path.display()),
            ))
        })?;
        log::info!("sink: creating file {}", path.display());
        Ok(Box::new(CsvSink::new(BufWriter::new(file))))
    }
}

/// Rows captured per category, header first.
pub type CapturedRows = BTreeMap<Category, Vec<Vec<String>>>;

/// Keeps everything in memory. Used by tests and by callers that want
/// the rows rather than files.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    rows: Arc<Mutex<CapturedRows>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn rows(&self) -> CapturedRows {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Data rows (header excluded) for one category.
    pub fn records(&self, category: Category) -> Vec<Vec<String>> {
        self.rows()
            .remove(&category)
            .map(|rows| rows.into_iter().skip(1).collect())
            .unwrap_or_default()
    }

    pub fn header(&self, category: Category) -> Option<Vec<String>> {
        self.rows().get(&category).and_then(|rows| rows.first().cloned())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, category: Category) -> CohortResult<Box<dyn RecordSink>> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(category, Vec::new());
        Ok(Box::new(MemorySink {
            category,
            buffer: Vec::new(),
            rows: Arc::clone(&self.rows),
        }))
    }
}

struct MemorySink {
    category: Category,
    buffer: Vec<Vec<String>>,
    rows: Arc<Mutex<CapturedRows>>,
}

impl RecordSink for MemorySink {
    fn write_header(&mut self, fields: &[String]) -> CohortResult<()> {
        self.buffer.push(fields.to_vec());
        Ok(())
    }

    fn write_record(&mut self, fields: &[String]) -> CohortResult<()> {
        self.buffer.push(fields.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> CohortResult<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.entry(self.category)
            .or_default()
            .append(&mut self.buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn csv_rows_are_quoted_only_when_needed() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write_header(&strings(&["subject_id", "code"])).unwrap();
        sink.write_record(&strings(&["1000001", "E11"])).unwrap();
        sink.write_record(&strings(&["1000002", "a,b"])).unwrap();
        sink.write_record(&strings(&["1000003", "say \"hi\""])).unwrap();
        sink.finish().unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text,
            "subject_id,code\n1000001,E11\n1000002,\"a,b\"\n1000003,\"say \"\"hi\"\"\"\n"
        );
    }

    #[test]
    fn csv_factory_writes_one_file_per_category() {
        let dir = std::env::temp_dir().join(format!("cohort-sink-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let factory = CsvSinkFactory::new(&dir);
        let mut sink = factory.open(Category::Clinic).unwrap();
        sink.write_header(&strings(&["subject_id", "service_date", "code"])).unwrap();
        sink.write_record(&strings(&["1000001", "2020-01-01", "250"])).unwrap();
        sink.finish().unwrap();
        drop(sink);

        let text = std::fs::read_to_string(factory.path_for(Category::Clinic)).unwrap();
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(text, "subject_id,service_date,code\n1000001,2020-01-01,250\n");
    }

    #[test]
    fn csv_factory_reports_unwritable_destination() {
        let factory = CsvSinkFactory::new("/nonexistent/cohort/output");
        assert!(matches!(factory.open(Category::Rx), Err(CohortError::Io(_))));
    }

    #[test]
    fn memory_sink_publishes_on_finish() {
        let factory = MemorySinkFactory::new();
        let mut sink = factory.open(Category::Person).unwrap();
        sink.write_header(&strings(&["subject_id"])).unwrap();
        sink.write_record(&strings(&["1"])).unwrap();
        assert!(factory.records(Category::Person).is_empty());
        sink.finish().unwrap();
        assert_eq!(factory.header(Category::Person), Some(strings(&["subject_id"])));
        assert_eq!(factory.records(Category::Person), vec![strings(&["1"])]);
    }
}
