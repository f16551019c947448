use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::Result;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// The envelope a tracer's payload is stored in.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub hostname: String,
    pub region: String,
    pub uploaded_time: String,
    pub time: String,
    pub tracer_name: String,
    pub tracer_time: String,
    pub tracer_data: serde_json::Value,
}

impl Document {
    pub fn new(tracer_name: &str, region: &str, tracer_time: DateTime<Local>, data: serde_json::Value) -> Self {
        let now = Local::now().format(TIME_FORMAT).to_string();
        Document {
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            region: region.to_string(),
            uploaded_time: now.clone(),
            time: now,
            tracer_name: tracer_name.to_string(),
            tracer_time: tracer_time.format(TIME_FORMAT).to_string(),
            tracer_data: data,
        }
    }
}

pub trait DocumentSink: Send {
    fn write(&mut self, doc: &Document) -> Result<()>;
}

/// One JSON line per document on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl DocumentSink for StdoutSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, doc)?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}

/// Appends one JSON line per document to a file.
pub struct LocalFileSink {
    writer: BufWriter<File>,
}

impl LocalFileSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LocalFileSink {
            writer: BufWriter::new(file),
        })
    }
}

impl DocumentSink for LocalFileSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        serde_json::to_writer(&mut self.writer, doc)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
