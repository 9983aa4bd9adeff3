//! Result persistence.
//!
//! The sequencer hands every finished [`Dut`] to a [`ResultSink`] at teardown.
//! The station sink combines two writers:
//!
//! - [`XmlExporter`]: one XML document per DUT in the result-log directory.
//!   Export is mandatory; a failure aborts the channel teardown.
//! - [`CsvArchive`]: append-only `duts.csv` / `cycles.csv` tables. Archival is
//!   best-effort.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StorageSettings;
use crate::dut::{Cycle, Dut};
use crate::error::{AppResult, StationError};

/// Destination of finished DUT records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Append the DUT record and its cycles to the archive.
    async fn archive_and_store(&self, dut: &Dut, cycles: &[Cycle]) -> AppResult<()>;

    /// Write the DUT record to a new file and return its path.
    async fn export_to_file(&self, dut: &Dut) -> AppResult<PathBuf>;
}

// ============================================================================
// XML Export
// ============================================================================

/// Writes one XML document per DUT.
#[derive(Debug, Clone)]
pub struct XmlExporter {
    dir: PathBuf,
    station: String,
    run_id: Uuid,
}

impl XmlExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let station = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            dir: dir.into(),
            station,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// First free `<stem>.xml`, `<stem>(1).xml`, `<stem>(2).xml`, ...
    fn unique_path(&self, stem: &str) -> PathBuf {
        let mut path = self.dir.join(format!("{stem}.xml"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}({n}).xml"));
            n += 1;
        }
        path
    }

    /// Render a DUT record as an XML document.
    pub fn render(&self, dut: &Dut) -> AppResult<String> {
        let value = serde_json::to_value(dut)?;
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<BURNIN station=\"{}\" run_id=\"{}\" exported=\"{}\">\n",
            escape(&self.station),
            self.run_id,
            Utc::now().to_rfc3339()
        ));
        write_element(&mut out, "DUT", &value, 1);
        out.push_str("</BURNIN>\n");
        Ok(out)
    }

    pub fn export(&self, dut: &Dut) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StationError::Export(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        let document = self.render(dut)?;
        let path = self.unique_path(&dut.barcode.raw);
        fs::write(&path, document)
            .map_err(|e| StationError::Export(format!("cannot write {}: {}", path.display(), e)))?;
        info!(slot = dut.slot, barcode = %dut.barcode, path = %path.display(), "results exported");
        Ok(path)
    }
}

fn write_element(out: &mut String, name: &str, value: &Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(fields) => {
            out.push_str(&format!("{indent}<{name}>\n"));
            for (key, field) in fields {
                write_element(out, key, field, depth + 1);
            }
            out.push_str(&format!("{indent}</{name}>\n"));
        }
        Value::Array(items) => {
            let item_name = name.strip_suffix('s').unwrap_or("item");
            out.push_str(&format!("{indent}<{name}>\n"));
            for item in items {
                write_element(out, item_name, item, depth + 1);
            }
            out.push_str(&format!("{indent}</{name}>\n"));
        }
        Value::Null => out.push_str(&format!("{indent}<{name}/>\n")),
        Value::String(text) => {
            out.push_str(&format!("{indent}<{name}>{}</{name}>\n", escape(text)));
        }
        other => out.push_str(&format!("{indent}<{name}>{other}</{name}>\n")),
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

// ============================================================================
// CSV Archive
// ============================================================================

#[derive(Debug, Serialize)]
struct DutRow<'a> {
    test_date: String,
    barcode: &'a str,
    part_number: &'a str,
    revision: &'a str,
    slot: usize,
    family: String,
    status: String,
    error_message: String,
    charge_time: f64,
    discharge_time: f64,
    capacitor_time: f64,
    capacitance: Option<f64>,
    hw_version: Option<&'a str>,
    fw_version: Option<&'a str>,
    cable_barcode: &'a str,
    capacitor_barcode: &'a str,
    vpd_programmed: bool,
}

#[derive(Debug, Serialize)]
struct CycleRow<'a> {
    barcode: &'a str,
    counter: u32,
    timestamp: String,
    elapsed: f64,
    vcap: f64,
    vin: f64,
    temp: f64,
    state: &'static str,
}

/// Append-only CSV tables of DUT records and their cycles.
#[derive(Debug, Clone)]
pub struct CsvArchive {
    dir: PathBuf,
}

impl CsvArchive {
    pub const DUT_TABLE: &'static str = "duts.csv";
    pub const CYCLE_TABLE: &'static str = "cycles.csv";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Open `name` for appending; the header row is written only for a new file.
    fn table(&self, name: &str) -> AppResult<csv::Writer<fs::File>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file))
    }

    pub fn append(&self, dut: &Dut, cycles: &[Cycle]) -> AppResult<()> {
        let mut duts = self.table(Self::DUT_TABLE)?;
        duts.serialize(DutRow {
            test_date: dut.test_date.to_rfc3339(),
            barcode: &dut.barcode.raw,
            part_number: &dut.barcode.part_number,
            revision: &dut.barcode.revision,
            slot: dut.slot,
            family: dut.family.to_string(),
            status: format!("{:?}", dut.status()),
            error_message: dut.error_message(),
            charge_time: dut.charge_time,
            discharge_time: dut.discharge_time,
            capacitor_time: dut.capacitor_time,
            capacitance: dut.capacitance_measured,
            hw_version: dut.hw_version.as_deref(),
            fw_version: dut.fw_version.as_deref(),
            cable_barcode: &dut.cable_barcode,
            capacitor_barcode: &dut.capacitor_barcode,
            vpd_programmed: dut.vpd_programmed,
        })?;
        duts.flush()?;

        if !cycles.is_empty() {
            let mut table = self.table(Self::CYCLE_TABLE)?;
            for cycle in cycles {
                table.serialize(CycleRow {
                    barcode: &dut.barcode.raw,
                    counter: cycle.counter,
                    timestamp: cycle.timestamp.to_rfc3339(),
                    elapsed: cycle.elapsed,
                    vcap: cycle.vcap,
                    vin: cycle.vin,
                    temp: cycle.temp,
                    state: match cycle.state {
                        crate::dut::CycleState::Charge => "charge",
                        crate::dut::CycleState::Discharge => "discharge",
                    },
                })?;
            }
            table.flush()?;
        }
        debug!(slot = dut.slot, cycles = cycles.len(), dir = %self.dir.display(), "results archived");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// ============================================================================
// Station Sink
// ============================================================================

/// XML export plus the optional CSV archive, as configured in `[storage]`.
#[derive(Debug, Clone)]
pub struct StationSink {
    exporter: XmlExporter,
    archive: Option<CsvArchive>,
}

impl StationSink {
    pub fn new(storage: &StorageSettings) -> Self {
        Self {
            exporter: XmlExporter::new(&storage.result_log),
            archive: storage.archive_dir.as_ref().map(CsvArchive::new),
        }
    }

    pub fn exporter(&self) -> &XmlExporter {
        &self.exporter
    }
}

#[async_trait]
impl ResultSink for StationSink {
    async fn archive_and_store(&self, dut: &Dut, cycles: &[Cycle]) -> AppResult<()> {
        match &self.archive {
            Some(archive) => archive.append(dut, cycles),
            None => Ok(()),
        }
    }

    async fn export_to_file(&self, dut: &Dut) -> AppResult<PathBuf> {
        self.exporter.export(dut)
    }
}
