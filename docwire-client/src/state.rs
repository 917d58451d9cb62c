//! Per-cursor protocol state.

use docwire_protocol::{CursorId, DecodeOptions, Document};
use std::collections::VecDeque;

/// Default number of documents requested per batch.
pub const DEFAULT_BATCH_SIZE: i32 = 1000;

/// State shared between a cursor and the wire layer.
///
/// `cursor_id` is `None` until the first reply arrives. Afterwards a zero id
/// means the server holds no cursor.
#[derive(Debug, Clone)]
pub struct CursorState {
    pub cursor_id: Option<CursorId>,
    /// Documents of the current batch not yet handed out.
    pub documents: VecDeque<Document>,
    pub batch_size: i32,
    /// Maximum number of documents to return. Zero means unlimited, negative
    /// means a single batch of at most `-limit` documents.
    pub limit: i32,
    pub skip: i32,
    /// Documents handed out so far.
    pub current_limit: i32,
    pub init: bool,
    pub dead: bool,
    pub killed: bool,
    pub notified: bool,
    /// Decode options for this cursor's replies. Falls back to the
    /// connection's options when unset.
    pub promote: Option<DecodeOptions>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            cursor_id: None,
            documents: VecDeque::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            limit: 0,
            skip: 0,
            current_limit: 0,
            init: false,
            dead: false,
            killed: false,
            notified: false,
            promote: None,
        }
    }
}

impl CursorState {
    pub fn new(limit: i32, skip: i32, batch_size: i32) -> Self {
        Self {
            limit,
            skip,
            batch_size,
            ..Self::default()
        }
    }

    /// Returns whether a server cursor is known to be open.
    pub fn has_live_cursor(&self) -> bool {
        self.cursor_id.is_some_and(|id| !id.is_zero())
    }

    /// Returns whether a positive limit has been reached.
    pub fn limit_reached(&self) -> bool {
        self.limit > 0 && self.current_limit >= self.limit
    }

    /// Batch size for the next getMore, trimmed so a positive limit is never
    /// exceeded.
    pub fn next_batch_size(&self) -> i32 {
        if self.limit > 0 && self.current_limit + self.batch_size > self.limit {
            self.limit - self.current_limit
        } else {
            self.batch_size
        }
    }

    /// Clears everything the server told us, keeping the shaping values.
    pub fn reset(&mut self) {
        *self = Self {
            limit: self.limit,
            skip: self.skip,
            batch_size: self.batch_size,
            promote: self.promote,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = CursorState::default();
        assert_eq!(state.batch_size, 1000);
        assert!(state.cursor_id.is_none());
        assert!(!state.has_live_cursor());
        assert!(!state.limit_reached());
    }

    #[test]
    fn test_next_batch_size_trimmed_to_limit() {
        let mut state = CursorState::new(25, 0, 10);
        state.current_limit = 20;
        assert_eq!(state.next_batch_size(), 5);

        state.current_limit = 10;
        assert_eq!(state.next_batch_size(), 10);

        let unlimited = CursorState::new(0, 0, 10);
        assert_eq!(unlimited.next_batch_size(), 10);
    }

    #[test]
    fn test_reset_keeps_shaping() {
        let mut state = CursorState::new(5, 2, 3);
        state.cursor_id = Some(CursorId::new(9));
        state.current_limit = 4;
        state.dead = true;
        state.documents.push_back(Document::new());

        state.reset();
        assert_eq!((state.limit, state.skip, state.batch_size), (5, 2, 3));
        assert!(state.cursor_id.is_none());
        assert!(state.documents.is_empty());
        assert_eq!(state.current_limit, 0);
        assert!(!state.dead);
    }
}
