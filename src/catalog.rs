/*!
# Sample catalog

An append-only, resumable record of the ensemble. Every generation appends one
[`CatalogRow`] per walker, holding the walker's post-move state. Rows are numbered by
a catalog-wide `sample_id` that starts at 0, never has gaps and is never reused, even
across process restarts.

Persistence is delegated to a [`CatalogSink`]. The catalog keeps every row in memory
for readers and queues new rows until the next [`SampleCatalog::flush`].

Readers get a [`CatalogReadHandle`] that can be sent to other threads. A read only
locks the catalog long enough to snapshot its length and its list of immutable row
segments. The scan itself runs without any lock.

```rust
use esmcmc::catalog::{CatalogRow, MemorySink, RunStatistics, SampleCatalog};

let catalog = SampleCatalog::open(Box::new(MemorySink::new()), 2, 1, Vec::new()).unwrap();
let rows = vec![
    CatalogRow::new(0, vec![0.5], 1.0),
    CatalogRow::new(1, vec![-0.5], 2.0),
];
let ids = catalog.append(rows, RunStatistics::default()).unwrap();
assert_eq!(ids, 0..2);

let view = catalog.view();
assert_eq!(view.current_length(), 2);
let costs: Vec<f64> = view.read_range(0, 2).map(|row| row.cost).collect();
assert_eq!(costs, vec![1.0, 2.0]);
```
*/

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Running counts over the lifetime of a catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_proposed: u64,
    pub total_accepted: u64,
    /// Proposals the objective rejected as outside its domain.
    pub total_offboard: u64,
}

impl RunStatistics {
    /// Adds the counts of one generation.
    pub fn record(&mut self, proposed: u64, accepted: u64, offboard: u64) {
        self.total_proposed += proposed;
        self.total_accepted += accepted;
        self.total_offboard += offboard;
    }

    /// Fraction of proposals that were accepted.
    pub fn accept_ratio(&self) -> f64 {
        ratio(self.total_accepted, self.total_proposed)
    }

    /// Fraction of proposals that fell outside the objective's domain.
    pub fn offboard_ratio(&self) -> f64 {
        ratio(self.total_offboard, self.total_proposed)
    }

    /// Recounts the statistics from catalog rows.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a CatalogRow>) -> Self {
        let mut stats = Self::default();
        for row in rows {
            stats.record(1, row.accepted as u64, row.offboard as u64);
        }
        stats
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// The state of one walker after one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    /// Assigned by the catalog on append.
    pub sample_id: u64,
    pub walker_index: usize,
    /// The walker moved during this generation.
    pub accepted: bool,
    /// The walker's proposal fell outside the objective's domain.
    pub offboard: bool,
    /// `-2 ln L` at `theta`; infinite while the walker was never evaluated.
    pub cost: f64,
    pub theta: Vec<f64>,
    /// Values of the objective's diagnostics at `theta`.
    pub extra: Vec<f64>,
}

impl CatalogRow {
    /// A row without diagnostics and flags; the sample id is filled in on append.
    pub fn new(walker_index: usize, theta: Vec<f64>, cost: f64) -> Self {
        Self {
            sample_id: 0,
            walker_index,
            accepted: false,
            offboard: false,
            cost,
            theta,
            extra: Vec::new(),
        }
    }
}

/// Counters persisted next to the rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounters {
    /// Id of the last row written, `None` for an empty catalog.
    pub last_sample_id: Option<u64>,
    pub stats: RunStatistics,
}

/// Iterator over rows read back from a sink.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<CatalogRow, CatalogError>> + 'a>;

/**
Persistence backend of a [`SampleCatalog`].

A sink owns the encoding. The catalog only requires that rows come back from
[`read_all`](Self::read_all) in the order they were written.
*/
pub trait CatalogSink: Send {
    /// Appends rows after the ones already stored.
    fn write_rows(&mut self, rows: &[CatalogRow]) -> Result<(), CatalogError>;

    /// Replaces the stored counters.
    fn write_counters(&mut self, counters: &CatalogCounters) -> Result<(), CatalogError>;

    /// All stored rows, oldest first.
    fn read_all(&mut self) -> Result<RowIter<'_>, CatalogError>;

    /// The stored counters, `None` when the sink holds none.
    fn recover_counters(&mut self) -> Result<Option<CatalogCounters>, CatalogError>;

    /// Deletes every row and the counters.
    fn truncate(&mut self) -> Result<(), CatalogError>;

    /// How many consecutive failed flushes a run tolerates before giving up.
    fn max_flush_retries(&self) -> u32 {
        3
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    rows: Vec<CatalogRow>,
    counters: Option<CatalogCounters>,
}

/// An in-memory sink. Clones share the same storage, so dropping a catalog and
/// opening a new one on a clone behaves like a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows written to the sink so far.
    pub fn len(&self) -> usize {
        self.store.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the stored rows.
    pub fn rows(&self) -> Vec<CatalogRow> {
        self.store.lock().rows.clone()
    }

    pub fn counters(&self) -> Option<CatalogCounters> {
        self.store.lock().counters
    }
}

impl CatalogSink for MemorySink {
    fn write_rows(&mut self, rows: &[CatalogRow]) -> Result<(), CatalogError> {
        self.store.lock().rows.extend_from_slice(rows);
        Ok(())
    }

    fn write_counters(&mut self, counters: &CatalogCounters) -> Result<(), CatalogError> {
        self.store.lock().counters = Some(*counters);
        Ok(())
    }

    fn read_all(&mut self) -> Result<RowIter<'_>, CatalogError> {
        let rows = self.store.lock().rows.clone();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn recover_counters(&mut self) -> Result<Option<CatalogCounters>, CatalogError> {
        Ok(self.store.lock().counters)
    }

    fn truncate(&mut self) -> Result<(), CatalogError> {
        let mut store = self.store.lock();
        store.rows.clear();
        store.counters = None;
        Ok(())
    }
}

/// Rows appended by one call, immutable once published.
#[derive(Debug, Clone)]
struct Segment {
    first_id: u64,
    rows: Arc<[CatalogRow]>,
}

impl Segment {
    fn end_id(&self) -> u64 {
        self.first_id + self.rows.len() as u64
    }
}

#[derive(Debug)]
struct CatalogShared {
    n_walkers: usize,
    n_params: usize,
    diagnostic_names: Vec<String>,
    segments: RwLock<Vec<Segment>>,
    len: AtomicU64,
}

impl CatalogShared {
    fn check_row(&self, row: &CatalogRow, sample_id: u64) -> Result<(), CatalogError> {
        let checks = [
            ("parameters", self.n_params, row.theta.len()),
            ("diagnostics", self.diagnostic_names.len(), row.extra.len()),
        ];
        for (what, expected, found) in checks {
            if expected != found {
                return Err(CatalogError::Shape {
                    sample_id,
                    what,
                    expected,
                    found,
                });
            }
        }
        if row.walker_index >= self.n_walkers {
            return Err(CatalogError::Corrupt(format!(
                "row {sample_id} belongs to walker {} but the ensemble has {} walkers",
                row.walker_index, self.n_walkers
            )));
        }
        Ok(())
    }
}

struct CatalogWriter {
    sink: Box<dyn CatalogSink>,
    /// Rows appended since the last successful flush.
    pending: Vec<CatalogRow>,
    counters_dirty: bool,
    next_id: u64,
    stats: RunStatistics,
}

impl CatalogWriter {
    fn counters(&self) -> CatalogCounters {
        CatalogCounters {
            last_sample_id: self.next_id.checked_sub(1),
            stats: self.stats,
        }
    }
}

/// The append-only sample record. See the [module documentation](self).
pub struct SampleCatalog {
    shared: Arc<CatalogShared>,
    writer: Mutex<CatalogWriter>,
}

impl SampleCatalog {
    /**
    Opens a catalog on top of `sink`, loading the rows it already holds.

    The sample-id counter continues after the last stored row. The run statistics come
    from the sink's counters when they agree with the stored rows, and are recounted
    from the rows otherwise.

    # Errors

    [`CatalogError::Corrupt`] or [`CatalogError::Shape`] if the stored rows have gaps in
    their ids or do not fit the ensemble.
    */
    pub fn open(
        mut sink: Box<dyn CatalogSink>,
        n_walkers: usize,
        n_params: usize,
        diagnostic_names: Vec<String>,
    ) -> Result<Self, CatalogError> {
        let shared = CatalogShared {
            n_walkers,
            n_params,
            diagnostic_names,
            segments: RwLock::new(Vec::new()),
            len: AtomicU64::new(0),
        };

        let rows = sink.read_all()?.collect::<Result<Vec<_>, _>>()?;
        for (k, row) in rows.iter().enumerate() {
            if row.sample_id != k as u64 {
                return Err(CatalogError::Corrupt(format!(
                    "expected sample id {k}, found {}",
                    row.sample_id
                )));
            }
            shared.check_row(row, row.sample_id)?;
        }

        let last_sample_id = rows.last().map(|row| row.sample_id);
        let stats = match sink.recover_counters()? {
            Some(counters) if counters.last_sample_id == last_sample_id => counters.stats,
            Some(counters) => {
                log::warn!(
                    "catalog counters end at {:?} but rows end at {:?}; recounting from rows",
                    counters.last_sample_id,
                    last_sample_id
                );
                RunStatistics::from_rows(&rows)
            }
            None => RunStatistics::from_rows(&rows),
        };

        let next_id = rows.len() as u64;
        if !rows.is_empty() {
            log::info!("resuming catalog with {next_id} rows");
            shared.segments.write().push(Segment {
                first_id: 0,
                rows: Arc::from(rows),
            });
            shared.len.store(next_id, Ordering::Release);
        }

        Ok(Self {
            shared: Arc::new(shared),
            writer: Mutex::new(CatalogWriter {
                sink,
                pending: Vec::new(),
                counters_dirty: false,
                next_id,
                stats,
            }),
        })
    }

    /**
    Appends one group of rows and records the run statistics that go with them.

    The rows receive contiguous sample ids, which are returned. Either every row is
    appended or, if any row has the wrong shape, none is.

    # Errors

    [`CatalogError::ConcurrentAppend`] when another append is in progress, and
    [`CatalogError::Shape`] for malformed rows.
    */
    pub fn append(
        &self,
        mut rows: Vec<CatalogRow>,
        stats: RunStatistics,
    ) -> Result<Range<u64>, CatalogError> {
        let mut writer = self
            .writer
            .try_lock()
            .ok_or(CatalogError::ConcurrentAppend)?;

        let first = writer.next_id;
        for (k, row) in rows.iter().enumerate() {
            self.shared.check_row(row, first + k as u64)?;
        }
        for (k, row) in rows.iter_mut().enumerate() {
            row.sample_id = first + k as u64;
        }
        let end = first + rows.len() as u64;

        writer.pending.extend_from_slice(&rows);
        writer.next_id = end;
        writer.stats = stats;
        writer.counters_dirty = true;

        if !rows.is_empty() {
            let mut segments = self.shared.segments.write();
            segments.push(Segment {
                first_id: first,
                rows: Arc::from(rows),
            });
            self.shared.len.store(end, Ordering::Release);
        }
        Ok(first..end)
    }

    /**
    Writes queued rows and the current counters to the sink.

    Returns the number of rows written. On failure the rows stay queued and the next
    flush retries them.
    */
    pub fn flush(&self) -> Result<usize, CatalogError> {
        let mut writer = self.writer.lock();
        let mut written = 0;
        if !writer.pending.is_empty() {
            let pending = std::mem::take(&mut writer.pending);
            if let Err(e) = writer.sink.write_rows(&pending) {
                writer.pending = pending;
                return Err(e);
            }
            written = pending.len();
        }
        if writer.counters_dirty {
            let counters = writer.counters();
            writer.sink.write_counters(&counters)?;
            writer.counters_dirty = false;
        }
        Ok(written)
    }

    /// Deletes every row, in memory and in the sink, and restarts ids at 0.
    pub fn truncate(&self) -> Result<(), CatalogError> {
        let mut writer = self.writer.lock();
        writer.sink.truncate()?;
        writer.pending.clear();
        writer.counters_dirty = false;
        writer.next_id = 0;
        writer.stats = RunStatistics::default();

        let mut segments = self.shared.segments.write();
        segments.clear();
        self.shared.len.store(0, Ordering::Release);
        Ok(())
    }

    pub fn current_length(&self) -> u64 {
        self.shared.len.load(Ordering::Acquire)
    }

    /// Run statistics recorded with the latest append (or recovered on open).
    pub fn stats(&self) -> RunStatistics {
        self.writer.lock().stats
    }

    /// Rows appended but not yet written to the sink.
    pub fn pending(&self) -> usize {
        self.writer.lock().pending.len()
    }

    pub fn max_flush_retries(&self) -> u32 {
        self.writer.lock().sink.max_flush_retries()
    }

    /// A read-only handle that can be shared with other threads.
    pub fn view(&self) -> CatalogReadHandle {
        CatalogReadHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only access to a [`SampleCatalog`].
#[derive(Debug, Clone)]
pub struct CatalogReadHandle {
    shared: Arc<CatalogShared>,
}

impl CatalogReadHandle {
    pub fn current_length(&self) -> u64 {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn n_walkers(&self) -> usize {
        self.shared.n_walkers
    }

    pub fn n_params(&self) -> usize {
        self.shared.n_params
    }

    pub fn diagnostic_names(&self) -> &[String] {
        &self.shared.diagnostic_names
    }

    /// Number of complete generations in the catalog.
    pub fn generations(&self) -> u64 {
        self.current_length() / self.shared.n_walkers as u64
    }

    /**
    Rows with `from_id <= sample_id < to_id`, as of the time of the call.

    Bounds past the end of the catalog are clamped. The returned iterator can be
    cloned to restart the scan.
    */
    pub fn read_range(&self, from_id: u64, to_id: u64) -> CatalogRange {
        let segments = self.shared.segments.read();
        let len = self.shared.len.load(Ordering::Acquire);
        let end = to_id.min(len);
        let start = from_id.min(end);

        let first = segments.partition_point(|s| s.end_id() <= start);
        let selected: Vec<Segment> = segments[first..]
            .iter()
            .take_while(|s| s.first_id < end)
            .cloned()
            .collect();
        drop(segments);

        CatalogRange {
            segments: selected,
            segment: 0,
            next_id: start,
            end,
        }
    }

    /// Every row currently in the catalog.
    pub fn read_all(&self) -> CatalogRange {
        self.read_range(0, u64::MAX)
    }
}

/// A finite, restartable scan over catalog rows. See [`CatalogReadHandle::read_range`].
#[derive(Debug, Clone)]
pub struct CatalogRange {
    segments: Vec<Segment>,
    segment: usize,
    next_id: u64,
    end: u64,
}

impl CatalogRange {
    /// Visits the remaining rows by reference, without cloning them.
    pub fn for_each_ref<F: FnMut(&CatalogRow)>(mut self, mut f: F) {
        while let Some(row) = self.next_ref() {
            f(row);
        }
    }

    fn next_ref(&mut self) -> Option<&CatalogRow> {
        while self.next_id < self.end {
            let segment = self.segments.get(self.segment)?;
            let offset = (self.next_id - segment.first_id) as usize;
            if offset < segment.rows.len() {
                self.next_id += 1;
                return Some(&self.segments[self.segment].rows[offset]);
            }
            self.segment += 1;
        }
        None
    }
}

impl Iterator for CatalogRange {
    type Item = CatalogRow;

    fn next(&mut self) -> Option<CatalogRow> {
        self.next_ref().cloned()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.end - self.next_id) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for CatalogRange {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn row(walker: usize, x: f64) -> CatalogRow {
        CatalogRow::new(walker, vec![x, -x], x * x)
    }

    fn generation(n_walkers: usize, x: f64) -> Vec<CatalogRow> {
        (0..n_walkers).map(|i| row(i, x + i as f64)).collect()
    }

    fn open(sink: &MemorySink) -> SampleCatalog {
        SampleCatalog::open(Box::new(sink.clone()), 2, 2, Vec::new()).unwrap()
    }

    #[test]
    fn appends_get_contiguous_ids() {
        let catalog = open(&MemorySink::new());
        assert_eq!(catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap(), 0..2);
        assert_eq!(catalog.append(generation(2, 1.0), RunStatistics::default()).unwrap(), 2..4);
        assert_eq!(catalog.append(Vec::new(), RunStatistics::default()).unwrap(), 4..4);
        let ids: Vec<u64> = catalog.view().read_all().map(|r| r.sample_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn malformed_group_is_rejected_whole() {
        let catalog = open(&MemorySink::new());
        let mut rows = generation(2, 0.0);
        rows[1].theta.push(1.0);
        let err = catalog.append(rows, RunStatistics::default()).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Shape {
                sample_id: 1,
                what: "parameters",
                expected: 2,
                found: 3
            }
        ));
        assert_eq!(catalog.current_length(), 0);
        assert_eq!(catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap(), 0..2);
    }

    #[test]
    fn rows_reach_the_sink_only_on_flush() {
        let sink = MemorySink::new();
        let catalog = open(&sink);
        let stats = RunStatistics {
            total_proposed: 2,
            total_accepted: 1,
            total_offboard: 0,
        };
        catalog.append(generation(2, 0.0), stats).unwrap();
        assert!(sink.is_empty());
        assert_eq!(catalog.pending(), 2);

        assert_eq!(catalog.flush().unwrap(), 2);
        assert_eq!(sink.len(), 2);
        assert_eq!(catalog.pending(), 0);
        assert_eq!(
            sink.counters(),
            Some(CatalogCounters {
                last_sample_id: Some(1),
                stats
            })
        );
        assert_eq!(catalog.flush().unwrap(), 0);
    }

    #[test]
    fn reopening_continues_ids_and_stats() {
        let sink = MemorySink::new();
        let stats = RunStatistics {
            total_proposed: 4,
            total_accepted: 3,
            total_offboard: 1,
        };
        {
            let catalog = open(&sink);
            catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap();
            catalog.append(generation(2, 1.0), stats).unwrap();
            catalog.flush().unwrap();
        }
        let catalog = open(&sink);
        assert_eq!(catalog.current_length(), 4);
        assert_eq!(catalog.stats(), stats);
        assert_eq!(catalog.append(generation(2, 2.0), stats).unwrap(), 4..6);
    }

    #[test]
    fn stale_counters_are_recounted_from_rows() {
        let mut sink = MemorySink::new();
        let mut rows = generation(2, 0.0);
        for (k, r) in rows.iter_mut().enumerate() {
            r.sample_id = k as u64;
        }
        rows[0].accepted = true;
        rows[1].offboard = true;
        sink.write_rows(&rows).unwrap();
        sink.write_counters(&CatalogCounters::default()).unwrap();

        let catalog = open(&sink);
        assert_eq!(
            catalog.stats(),
            RunStatistics {
                total_proposed: 2,
                total_accepted: 1,
                total_offboard: 1
            }
        );
    }

    #[test]
    fn gaps_in_stored_ids_are_corruption() {
        let mut sink = MemorySink::new();
        let mut rows = generation(2, 0.0);
        rows[0].sample_id = 0;
        rows[1].sample_id = 5;
        sink.write_rows(&rows).unwrap();
        assert!(matches!(
            SampleCatalog::open(Box::new(sink), 2, 2, Vec::new()),
            Err(CatalogError::Corrupt(_))
        ));
    }

    #[test]
    fn truncate_empties_catalog_and_sink() {
        let sink = MemorySink::new();
        let catalog = open(&sink);
        catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap();
        catalog.flush().unwrap();
        catalog.truncate().unwrap();
        assert_eq!(catalog.current_length(), 0);
        assert!(sink.is_empty());
        assert_eq!(sink.counters(), None);
        assert_eq!(catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap(), 0..2);
    }

    #[test]
    fn read_range_clamps_and_restarts() {
        let catalog = open(&MemorySink::new());
        for g in 0..3 {
            catalog.append(generation(2, g as f64), RunStatistics::default()).unwrap();
        }
        let view = catalog.view();
        let range = view.read_range(1, 4);
        assert_eq!(range.len(), 3);
        let first: Vec<u64> = range.clone().map(|r| r.sample_id).collect();
        let again: Vec<u64> = range.map(|r| r.sample_id).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(first, again);

        assert_eq!(view.read_range(4, 100).count(), 2);
        assert_eq!(view.read_range(10, 20).count(), 0);
        assert_eq!(view.read_range(3, 1).count(), 0);
        assert_eq!(view.generations(), 3);
    }

    #[test]
    fn scans_see_a_fixed_snapshot() {
        let catalog = open(&MemorySink::new());
        catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap();
        let view = catalog.view();
        let range = view.read_all();
        catalog.append(generation(2, 1.0), RunStatistics::default()).unwrap();
        assert_eq!(range.count(), 2);
        assert_eq!(view.read_all().count(), 4);
    }

    #[test]
    fn for_each_ref_visits_rows_in_order() {
        let catalog = open(&MemorySink::new());
        catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap();
        catalog.append(generation(2, 5.0), RunStatistics::default()).unwrap();
        let mut xs = Vec::new();
        catalog.view().read_range(1, 3).for_each_ref(|r| xs.push(r.theta[0]));
        assert_eq!(xs, vec![1.0, 5.0]);
    }

    #[test]
    fn concurrent_append_is_detected() {
        let catalog = open(&MemorySink::new());
        let _guard = catalog.writer.lock();
        assert!(matches!(
            catalog.append(generation(2, 0.0), RunStatistics::default()),
            Err(CatalogError::ConcurrentAppend)
        ));
    }

    struct FlakySink {
        inner: MemorySink,
        failures_left: Arc<AtomicUsize>,
    }

    impl CatalogSink for FlakySink {
        fn write_rows(&mut self, rows: &[CatalogRow]) -> Result<(), CatalogError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CatalogError::Io(std::io::Error::other("disk full")));
            }
            self.inner.write_rows(rows)
        }

        fn write_counters(&mut self, counters: &CatalogCounters) -> Result<(), CatalogError> {
            self.inner.write_counters(counters)
        }

        fn read_all(&mut self) -> Result<RowIter<'_>, CatalogError> {
            self.inner.read_all()
        }

        fn recover_counters(&mut self) -> Result<Option<CatalogCounters>, CatalogError> {
            self.inner.recover_counters()
        }

        fn truncate(&mut self) -> Result<(), CatalogError> {
            self.inner.truncate()
        }
    }

    #[test]
    fn failed_flush_keeps_rows_queued() {
        let inner = MemorySink::new();
        let sink = FlakySink {
            inner: inner.clone(),
            failures_left: Arc::new(AtomicUsize::new(1)),
        };
        let catalog = SampleCatalog::open(Box::new(sink), 2, 2, Vec::new()).unwrap();
        catalog.append(generation(2, 0.0), RunStatistics::default()).unwrap();

        assert!(catalog.flush().is_err());
        assert_eq!(catalog.pending(), 2);
        assert!(inner.is_empty());

        catalog.append(generation(2, 1.0), RunStatistics::default()).unwrap();
        assert_eq!(catalog.flush().unwrap(), 4);
        let ids: Vec<u64> = inner.rows().iter().map(|r| r.sample_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn statistics_ratios() {
        let mut stats = RunStatistics::default();
        assert_eq!(stats.accept_ratio(), 0.0);
        stats.record(8, 4, 2);
        stats.record(8, 2, 0);
        assert_eq!(stats.accept_ratio(), 6.0 / 16.0);
        assert_eq!(stats.offboard_ratio(), 2.0 / 16.0);
    }
}
