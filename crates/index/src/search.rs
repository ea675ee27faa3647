//! Bounded search primitives
//!
//! Every tag-index scan runs under a loop budget instead of a wall-clock
//! timeout: `max_loops = max_metrics × loops_per_metric`. A scan that
//! exhausts its budget is more expensive than matching the candidates'
//! metric names directly, so it raises the fallback signal and the caller
//! switches strategy. The signal never crosses the public API.

use series_core::Error;
use series_table::{Table, TableSearch};

/// Crate-private scan outcome
#[derive(Debug)]
pub(crate) enum ScanError {
    /// Loop budget exhausted; switch to metric-name matching
    Fallback,
    /// A real error from the table or a corrupt row
    Db(Error),
}

impl From<Error> for ScanError {
    fn from(err: Error) -> Self {
        ScanError::Db(err)
    }
}

pub(crate) type ScanResult<T> = std::result::Result<T, ScanError>;

/// Budget for scans that must run to completion
pub(crate) const UNBOUNDED_LOOPS: u64 = u64::MAX;

/// A table cursor that charges one loop per step
pub(crate) struct BoundedScanner {
    ts: Box<dyn TableSearch>,
    loops: u64,
    max_loops: u64,
}

impl BoundedScanner {
    /// Open a scanner over `table` with the given loop budget
    pub fn new(table: &dyn Table, max_loops: u64) -> Self {
        BoundedScanner {
            ts: table.search(),
            loops: 0,
            max_loops,
        }
    }

    /// Position before the first item ≥ `prefix`
    pub fn seek(&mut self, prefix: &[u8]) {
        self.ts.seek(prefix);
    }

    /// Advance one item, charging the budget
    pub fn next_item(&mut self) -> ScanResult<bool> {
        self.loops += 1;
        if self.loops > self.max_loops {
            return Err(ScanError::Fallback);
        }
        if self.ts.next_item() {
            return Ok(true);
        }
        if let Some(err) = self.ts.error() {
            return Err(ScanError::Db(err.clone()));
        }
        Ok(false)
    }

    /// The item the cursor rests on
    pub fn current_item(&self) -> &[u8] {
        self.ts.current_item()
    }

    /// Loops consumed so far
    #[allow(dead_code)]
    pub fn loops(&self) -> u64 {
        self.loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use series_table::{MemTable, TableCallbacks};
    use tempfile::tempdir;

    #[test]
    fn test_budget_exhaustion_raises_fallback() {
        let dir = tempdir().unwrap();
        let table = MemTable::open(dir.path(), TableCallbacks::default()).unwrap();
        table
            .add_items((0..10u8).map(|i| vec![i]).collect())
            .unwrap();

        let mut scanner = BoundedScanner::new(table.as_ref(), 3);
        scanner.seek(b"");
        assert!(matches!(scanner.next_item(), Ok(true)));
        assert!(matches!(scanner.next_item(), Ok(true)));
        assert!(matches!(scanner.next_item(), Ok(true)));
        assert!(matches!(scanner.next_item(), Err(ScanError::Fallback)));
    }

    #[test]
    fn test_end_of_data_is_not_an_error() {
        let dir = tempdir().unwrap();
        let table = MemTable::open(dir.path(), TableCallbacks::default()).unwrap();
        table.add_items(vec![vec![1]]).unwrap();

        let mut scanner = BoundedScanner::new(table.as_ref(), UNBOUNDED_LOOPS);
        scanner.seek(b"");
        assert!(matches!(scanner.next_item(), Ok(true)));
        assert_eq!(scanner.current_item(), &[1]);
        assert!(matches!(scanner.next_item(), Ok(false)));
        assert_eq!(scanner.loops(), 2);
    }
}
