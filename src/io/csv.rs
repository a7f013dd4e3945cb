/*!
# CSV catalog sink

A [`CatalogSink`] that stores catalog rows in one CSV file. Enable via the `csv`
feature (on by default).

The row file has the header

```text
sample_id,walker,accepted,offboard,cost,theta_0,...,theta_{M-1},<diagnostic names>
```

and only ever grows. Next to it live

- `<file>.stats.csv`: the run counters, replaced atomically (write to a temporary
  file, then rename) on every flush,
- `<file>.lock`: holds an exclusive OS advisory lock for as long as the sink lives.
  A second sink on the same file fails with [`CatalogError::Locked`]. The operating
  system releases the lock when the sink is dropped or the process dies, so a lock
  file left behind after a crash does not block the next run.

A batch of rows is written completely or not at all: if a write fails part way, the
file is cut back to its previous length before the error is returned.

# Examples

```rust
use esmcmc::catalog::{CatalogRow, RunStatistics, SampleCatalog};
use esmcmc::io::csv::CsvCatalogSink;

let dir = tempfile::tempdir()?;
let path = dir.path().join("chain.csv");

let sink = CsvCatalogSink::open(&path, 1, &[])?;
let catalog = SampleCatalog::open(Box::new(sink), 2, 1, Vec::new())?;
catalog.append(vec![CatalogRow::new(0, vec![0.5], 1.0), CatalogRow::new(1, vec![1.5], 2.0)],
               RunStatistics::default())?;
catalog.flush()?;
drop(catalog);

let contents = std::fs::read_to_string(&path)?;
assert_eq!(contents.lines().next(), Some("sample_id,walker,accepted,offboard,cost,theta_0"));
assert_eq!(contents.lines().count(), 3);
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogCounters, CatalogRow, CatalogSink, RowIter, RunStatistics};
use crate::error::CatalogError;

/// Columns before the parameters.
const FIXED_COLUMNS: [&str; 5] = ["sample_id", "walker", "accepted", "offboard", "cost"];

#[derive(Debug, Serialize, Deserialize)]
struct StatsRecord {
    last_sample_id: Option<u64>,
    total_proposed: u64,
    total_accepted: u64,
    total_offboard: u64,
}

impl From<&CatalogCounters> for StatsRecord {
    fn from(c: &CatalogCounters) -> Self {
        Self {
            last_sample_id: c.last_sample_id,
            total_proposed: c.stats.total_proposed,
            total_accepted: c.stats.total_accepted,
            total_offboard: c.stats.total_offboard,
        }
    }
}

impl From<StatsRecord> for CatalogCounters {
    fn from(r: StatsRecord) -> Self {
        Self {
            last_sample_id: r.last_sample_id,
            stats: RunStatistics {
                total_proposed: r.total_proposed,
                total_accepted: r.total_accepted,
                total_offboard: r.total_offboard,
            },
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// A catalog stored as CSV files. See the [module documentation](self).
#[derive(Debug)]
pub struct CsvCatalogSink {
    path: PathBuf,
    stats_path: PathBuf,
    header: Vec<String>,
    n_params: usize,
    // Locked for the lifetime of the sink; closing it releases the lock.
    _lock: File,
}

impl CsvCatalogSink {
    /**
    Opens (or creates) the catalog file at `path` and takes its lock.

    # Errors

    [`CatalogError::Locked`] if another sink holds the lock, and
    [`CatalogError::Corrupt`] if an existing file has a different header.
    */
    pub fn open(
        path: impl AsRef<Path>,
        n_params: usize,
        diagnostic_names: &[String],
    ) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(with_suffix(&path, ".lock"))?;
        if !FileExt::try_lock_exclusive(&lock)? {
            return Err(CatalogError::Locked(path));
        }
        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;

        let mut header: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
        header.extend((0..n_params).map(|i| format!("theta_{i}")));
        header.extend(diagnostic_names.iter().cloned());

        let sink = Self {
            stats_path: with_suffix(&path, ".stats.csv"),
            path,
            header,
            n_params,
            _lock: lock,
        };

        let existing = fs::metadata(&sink.path).map(|m| m.len() > 0).unwrap_or(false);
        if existing {
            sink.check_header()?;
            log::debug!("reopened catalog file {}", sink.path.display());
        } else {
            sink.write_header()?;
        }
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    fn write_header(&self) -> Result<(), CatalogError> {
        let mut wtr = WriterBuilder::new().from_path(&self.path)?;
        wtr.write_record(&self.header)?;
        wtr.flush()?;
        Ok(())
    }

    fn check_header(&self) -> Result<(), CatalogError> {
        let mut rdr = ReaderBuilder::new().from_path(&self.path)?;
        let found = rdr.headers()?;
        if found.iter().ne(self.header.iter().map(String::as_str)) {
            return Err(CatalogError::Corrupt(format!(
                "{} has header {:?}, expected {:?}",
                self.path.display(),
                found,
                self.header
            )));
        }
        Ok(())
    }

    fn append_records(&self, file: &File, rows: &[CatalogRow]) -> Result<(), CatalogError> {
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
        let mut record = Vec::with_capacity(self.header.len());
        for row in rows {
            let width = FIXED_COLUMNS.len() + row.theta.len() + row.extra.len();
            if width != self.header.len() {
                return Err(CatalogError::Shape {
                    sample_id: row.sample_id,
                    what: "columns",
                    expected: self.header.len(),
                    found: width,
                });
            }
            record.clear();
            record.push(row.sample_id.to_string());
            record.push(row.walker_index.to_string());
            record.push(row.accepted.to_string());
            record.push(row.offboard.to_string());
            record.push(row.cost.to_string());
            record.extend(row.theta.iter().map(|v| v.to_string()));
            record.extend(row.extra.iter().map(|v| v.to_string()));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn field<T: FromStr>(record: &StringRecord, index: usize, name: &str) -> Result<T, CatalogError> {
    let raw = record.get(index).unwrap_or("");
    raw.parse().map_err(|_| {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        CatalogError::Corrupt(format!("line {line}: cannot parse {name} from {raw:?}"))
    })
}

fn parse_row(record: &StringRecord, n_params: usize, width: usize) -> Result<CatalogRow, CatalogError> {
    if record.len() != width {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        return Err(CatalogError::Corrupt(format!(
            "line {line} has {} fields, expected {width}",
            record.len()
        )));
    }
    let k = FIXED_COLUMNS.len();
    let values = |range: std::ops::Range<usize>| {
        range
            .map(|i| field::<f64>(record, i, "value"))
            .collect::<Result<Vec<_>, _>>()
    };
    Ok(CatalogRow {
        sample_id: field(record, 0, "sample_id")?,
        walker_index: field(record, 1, "walker")?,
        accepted: field(record, 2, "accepted")?,
        offboard: field(record, 3, "offboard")?,
        cost: field(record, 4, "cost")?,
        theta: values(k..k + n_params)?,
        extra: values(k + n_params..width)?,
    })
}

impl CatalogSink for CsvCatalogSink {
    fn write_rows(&mut self, rows: &[CatalogRow]) -> Result<(), CatalogError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let len = file.metadata()?.len();
        // The csv writer is dropped (and flushes what it buffered) before the rollback.
        if let Err(e) = self.append_records(&file, rows) {
            log::warn!(
                "write to {} failed, truncating it back to {len} bytes",
                self.path.display()
            );
            file.set_len(len)?;
            return Err(e);
        }
        Ok(())
    }

    fn write_counters(&mut self, counters: &CatalogCounters) -> Result<(), CatalogError> {
        let tmp = with_suffix(&self.stats_path, ".tmp");
        {
            let mut wtr = WriterBuilder::new().from_path(&tmp)?;
            wtr.serialize(StatsRecord::from(counters))?;
            wtr.flush()?;
        }
        fs::rename(&tmp, &self.stats_path)?;
        Ok(())
    }

    fn read_all(&mut self) -> Result<RowIter<'_>, CatalogError> {
        self.check_header()?;
        let rdr = ReaderBuilder::new().from_path(&self.path)?;
        let n_params = self.n_params;
        let width = self.header.len();
        Ok(Box::new(rdr.into_records().map(move |record| {
            parse_row(&record?, n_params, width)
        })))
    }

    fn recover_counters(&mut self) -> Result<Option<CatalogCounters>, CatalogError> {
        let file = match File::open(&self.stats_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut rdr = ReaderBuilder::new().from_reader(file);
        let record = rdr.deserialize::<StatsRecord>().next().transpose()?;
        Ok(record.map(CatalogCounters::from))
    }

    fn truncate(&mut self) -> Result<(), CatalogError> {
        self.write_header()?;
        match fs::remove_file(&self.stats_path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SampleCatalog;
    use tempfile::tempdir;

    fn rows() -> Vec<CatalogRow> {
        vec![
            CatalogRow {
                sample_id: 0,
                walker_index: 0,
                accepted: true,
                offboard: false,
                cost: 0.125,
                theta: vec![1.5, -2.25],
                extra: vec![3.0],
            },
            CatalogRow {
                sample_id: 1,
                walker_index: 1,
                accepted: false,
                offboard: true,
                cost: f64::INFINITY,
                theta: vec![0.1, 1e-12],
                extra: vec![-0.0],
            },
        ]
    }

    #[test]
    fn new_file_gets_a_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let _sink = CsvCatalogSink::open(&path, 2, &["radius".to_string()]).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.trim(),
            "sample_id,walker,accepted,offboard,cost,theta_0,theta_1,radius"
        );
    }

    #[test]
    fn rows_read_back_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut sink = CsvCatalogSink::open(&path, 2, &["radius".to_string()]).unwrap();
        sink.write_rows(&rows()).unwrap();
        let back: Vec<CatalogRow> = sink.read_all().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(back, rows());
    }

    #[test]
    fn counters_round_trip_through_the_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut sink = CsvCatalogSink::open(&path, 2, &[]).unwrap();
        assert_eq!(sink.recover_counters().unwrap(), None);

        let counters = CatalogCounters {
            last_sample_id: Some(15),
            stats: RunStatistics {
                total_proposed: 16,
                total_accepted: 9,
                total_offboard: 2,
            },
        };
        sink.write_counters(&counters).unwrap();
        assert_eq!(sink.recover_counters().unwrap(), Some(counters));
        assert!(sink.stats_path().exists());

        let empty = CatalogCounters::default();
        sink.write_counters(&empty).unwrap();
        assert_eq!(sink.recover_counters().unwrap(), Some(empty));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let first = CsvCatalogSink::open(&path, 1, &[]).unwrap();
        assert!(matches!(
            CsvCatalogSink::open(&path, 1, &[]),
            Err(CatalogError::Locked(_))
        ));
        drop(first);
        assert!(CsvCatalogSink::open(&path, 1, &[]).is_ok());
    }

    #[test]
    fn lock_is_held_until_the_sink_is_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        // A sink that is never dropped keeps its lock.
        std::mem::forget(CsvCatalogSink::open(&path, 1, &[]).unwrap());
        assert!(matches!(
            CsvCatalogSink::open(&path, 1, &[]),
            Err(CatalogError::Locked(_))
        ));
    }

    #[test]
    fn stale_lock_file_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        fs::write(with_suffix(&path, ".lock"), "12345\n").unwrap();
        let sink = CsvCatalogSink::open(&path, 1, &[]).unwrap();
        drop(sink);
        assert!(with_suffix(&path, ".lock").exists());
        assert!(CsvCatalogSink::open(&path, 1, &[]).is_ok());
    }

    #[test]
    fn failed_batch_leaves_the_file_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut sink = CsvCatalogSink::open(&path, 2, &["radius".to_string()]).unwrap();
        sink.write_rows(&rows()).unwrap();
        let before = fs::read(&path).unwrap();

        let mut next = rows();
        for (k, row) in next.iter_mut().enumerate() {
            row.sample_id = 2 + k as u64;
        }
        next[1].extra.push(1.0);
        let err = sink.write_rows(&next).unwrap_err();
        assert!(matches!(err, CatalogError::Shape { sample_id: 3, .. }), "{err}");
        assert_eq!(fs::read(&path).unwrap(), before);

        // Retrying the repaired batch does not duplicate its first row.
        next[1].extra.pop();
        sink.write_rows(&next).unwrap();
        let ids: Vec<u64> = sink
            .read_all()
            .unwrap()
            .map(|row| row.unwrap().sample_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn header_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        drop(CsvCatalogSink::open(&path, 2, &[]).unwrap());
        assert!(matches!(
            CsvCatalogSink::open(&path, 3, &[]),
            Err(CatalogError::Corrupt(_))
        ));
    }

    #[test]
    fn malformed_rows_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut sink = CsvCatalogSink::open(&path, 1, &[]).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "0,0,true,false,abc,1.0").unwrap();
        let err = sink
            .read_all()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert!(err.to_string().contains("cost"), "{err}");
    }

    #[test]
    fn truncate_keeps_only_the_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut sink = CsvCatalogSink::open(&path, 2, &["radius".to_string()]).unwrap();
        sink.write_rows(&rows()).unwrap();
        sink.write_counters(&CatalogCounters::default()).unwrap();
        sink.truncate().unwrap();
        assert_eq!(sink.read_all().unwrap().count(), 0);
        assert_eq!(sink.recover_counters().unwrap(), None);
    }

    #[test]
    fn catalog_resumes_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let stats = RunStatistics {
            total_proposed: 2,
            total_accepted: 1,
            total_offboard: 1,
        };
        {
            let sink = CsvCatalogSink::open(&path, 2, &[]).unwrap();
            let catalog = SampleCatalog::open(Box::new(sink), 2, 2, Vec::new()).unwrap();
            let mut generation = rows();
            for row in &mut generation {
                row.extra.clear();
            }
            catalog.append(generation, stats).unwrap();
            catalog.flush().unwrap();
        }
        let sink = CsvCatalogSink::open(&path, 2, &[]).unwrap();
        let catalog = SampleCatalog::open(Box::new(sink), 2, 2, Vec::new()).unwrap();
        assert_eq!(catalog.current_length(), 2);
        assert_eq!(catalog.stats(), stats);
        let next = vec![
            CatalogRow::new(0, vec![0.0, 0.0], 0.0),
            CatalogRow::new(1, vec![0.0, 0.0], 0.0),
        ];
        assert_eq!(catalog.append(next, stats).unwrap(), 2..4);
    }
}
