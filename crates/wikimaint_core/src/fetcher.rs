use tracing::debug;

use crate::cursor::Window;
use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::row::{Key, Row};

/// Smallest and largest key present in a source when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBounds {
    pub min: Key,
    pub max: Key,
}

/// Paginated read access to one table, backed by a replica-class connection.
pub trait RowSource {
    /// One bounded read: every row with `window.low <= key < window.high`.
    fn select(&mut self, window: Window) -> Result<Vec<Row>, FetchError>;

    /// `None` when the source is empty or cannot tell.
    fn key_bounds(&mut self) -> Result<Option<KeyBounds>, FetchError> {
        Ok(None)
    }
}

impl<S: RowSource + ?Sized> RowSource for Box<S> {
    fn select(&mut self, window: Window) -> Result<Vec<Row>, FetchError> {
        (**self).select(window)
    }

    fn key_bounds(&mut self) -> Result<Option<KeyBounds>, FetchError> {
        (**self).key_bounds()
    }
}

pub struct BatchFetcher<S> {
    source: S,
    retry: RetryPolicy,
    reads: usize,
}

impl<S: RowSource> BatchFetcher<S> {
    pub fn new(source: S, retry: RetryPolicy) -> Self {
        Self {
            source,
            retry,
            reads: 0,
        }
    }

    /// Number of read queries issued so far, retries included.
    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn key_bounds(&mut self) -> Result<Option<KeyBounds>, FetchError> {
        let source = &mut self.source;
        let reads = &mut self.reads;
        self.retry.run("key bounds", |_| {
            *reads += 1;
            source.key_bounds()
        })
    }

    /// Reads one window. Rows come back in ascending key order; a row outside
    /// the window is a contract violation by the source and fails the read.
    pub fn fetch(&mut self, window: Window) -> Result<Vec<Row>, FetchError> {
        let source = &mut self.source;
        let reads = &mut self.reads;
        let mut rows = self.retry.run(&format!("fetch {window}"), |_| {
            *reads += 1;
            source.select(window)
        })?;

        if let Some(stray) = rows.iter().find(|row| !window.contains(row.key)) {
            return Err(FetchError::Fatal(format!(
                "source returned key {} outside window {window}",
                stray.key
            )));
        }
        if !rows.is_sorted_by_key(|row| row.key) {
            rows.sort_by_key(|row| row.key);
        }
        debug!("fetched {} rows for window {window}", rows.len());
        Ok(rows)
    }
}
