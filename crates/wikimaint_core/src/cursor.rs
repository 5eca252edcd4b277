use std::fmt;

use serde::Serialize;

use crate::error::{ConfigError, CursorError};
use crate::row::Key;

/// Half-open key range `[low, high)` processed as one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub low: Key,
    pub high: Key,
}

impl Window {
    pub fn contains(&self, key: Key) -> bool {
        key >= self.low && key < self.high
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// Walks the key space in fixed-size windows. The position only moves when
/// the caller confirms a window through [`RowCursor::advance`].
///
/// Windows are half-open and the last one ends at `Key::MAX`, so a row keyed
/// exactly `Key::MAX` is never inside any window.
#[derive(Debug, Clone)]
pub struct RowCursor {
    position: Key,
    batch_size: Key,
}

impl RowCursor {
    pub fn new(start: Key, batch_size: i64) -> Result<Self, ConfigError> {
        if batch_size <= 0 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        Ok(Self {
            position: start,
            batch_size,
        })
    }

    /// Last confirmed position; the low key of the next window.
    pub fn position(&self) -> Key {
        self.position
    }

    pub fn batch_size(&self) -> Key {
        self.batch_size
    }

    pub fn next_window(&self) -> Window {
        Window {
            low: self.position,
            high: self.position.saturating_add(self.batch_size),
        }
    }

    /// True once the key space is used up and no further window can be cut.
    pub fn is_exhausted(&self) -> bool {
        self.position == Key::MAX
    }

    pub fn advance(&mut self, new_cursor: Key) -> Result<(), CursorError> {
        if new_cursor < self.position {
            return Err(CursorError::Regressed {
                from: self.position,
                to: new_cursor,
            });
        }
        let limit = self.next_window().high;
        if new_cursor > limit {
            return Err(CursorError::Skipped {
                from: self.position,
                to: new_cursor,
                limit,
            });
        }
        self.position = new_cursor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_batch_size() {
        assert!(matches!(
            RowCursor::new(1, 0),
            Err(ConfigError::InvalidBatchSize(0))
        ));
        assert!(matches!(
            RowCursor::new(1, -5),
            Err(ConfigError::InvalidBatchSize(-5))
        ));
    }

    #[test]
    fn consecutive_windows_share_boundaries() {
        let mut cursor = RowCursor::new(1, 100).expect("cursor");
        let mut windows = Vec::new();
        for _ in 0..4 {
            let window = cursor.next_window();
            windows.push(window);
            cursor.advance(window.high).expect("advance");
        }
        assert_eq!(windows[0], Window { low: 1, high: 101 });
        for pair in windows.windows(2) {
            assert_eq!(pair[0].high, pair[1].low);
        }
        assert_eq!(cursor.position(), 401);
    }

    #[test]
    fn next_window_is_stable_until_advanced() {
        let cursor = RowCursor::new(10, 5).expect("cursor");
        assert_eq!(cursor.next_window(), cursor.next_window());
        assert_eq!(cursor.position(), 10);
    }

    #[test]
    fn advance_refuses_regression_and_skips() {
        let mut cursor = RowCursor::new(100, 10).expect("cursor");
        assert_eq!(
            cursor.advance(99),
            Err(CursorError::Regressed { from: 100, to: 99 })
        );
        assert_eq!(
            cursor.advance(111),
            Err(CursorError::Skipped {
                from: 100,
                to: 111,
                limit: 110
            })
        );
        cursor.advance(105).expect("partial advance inside window");
        assert_eq!(cursor.position(), 105);
    }

    #[test]
    fn window_saturates_at_key_space_end() {
        let mut cursor = RowCursor::new(Key::MAX - 3, 10).expect("cursor");
        let window = cursor.next_window();
        assert_eq!(window.high, Key::MAX);
        cursor.advance(window.high).expect("advance");
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn largest_key_is_outside_the_final_window() {
        let cursor = RowCursor::new(Key::MAX - 1, 10).expect("cursor");
        let window = cursor.next_window();
        assert!(window.contains(Key::MAX - 1));
        assert!(!window.contains(Key::MAX));
    }

    #[test]
    fn window_contains_is_half_open() {
        let window = Window { low: 1, high: 101 };
        assert!(window.contains(1));
        assert!(window.contains(100));
        assert!(!window.contains(101));
        assert_eq!(window.to_string(), "[1, 101)");
    }
}
