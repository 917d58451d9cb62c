//! Query and reply flag bitfields.

/// OP_QUERY flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// Cursor is not closed when the last data is retrieved.
    pub const TAILABLE_CURSOR: u32 = 1 << 1;
    /// Allow query of replica secondaries.
    pub const SLAVE_OK: u32 = 1 << 2;
    /// Internal replication flag.
    pub const OPLOG_REPLAY: u32 = 1 << 3;
    /// Server does not time out idle cursors.
    pub const NO_CURSOR_TIMEOUT: u32 = 1 << 4;
    /// Block at the end of a tailable cursor instead of returning no data.
    pub const AWAIT_DATA: u32 = 1 << 5;
    /// Stream all results without waiting for getMore.
    pub const EXHAUST: u32 = 1 << 6;
    /// Return partial results if some shards are down.
    pub const PARTIAL: u32 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    fn set(mut self, bit: u32, on: bool) -> Self {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }

    pub fn with_tailable(self, on: bool) -> Self {
        self.set(Self::TAILABLE_CURSOR, on)
    }

    pub fn with_slave_ok(self, on: bool) -> Self {
        self.set(Self::SLAVE_OK, on)
    }

    pub fn with_oplog_replay(self, on: bool) -> Self {
        self.set(Self::OPLOG_REPLAY, on)
    }

    pub fn with_no_cursor_timeout(self, on: bool) -> Self {
        self.set(Self::NO_CURSOR_TIMEOUT, on)
    }

    pub fn with_await_data(self, on: bool) -> Self {
        self.set(Self::AWAIT_DATA, on)
    }

    pub fn with_exhaust(self, on: bool) -> Self {
        self.set(Self::EXHAUST, on)
    }

    pub fn with_partial(self, on: bool) -> Self {
        self.set(Self::PARTIAL, on)
    }

    pub fn is_tailable(&self) -> bool {
        self.0 & Self::TAILABLE_CURSOR != 0
    }

    pub fn is_slave_ok(&self) -> bool {
        self.0 & Self::SLAVE_OK != 0
    }

    pub fn is_oplog_replay(&self) -> bool {
        self.0 & Self::OPLOG_REPLAY != 0
    }

    pub fn is_no_cursor_timeout(&self) -> bool {
        self.0 & Self::NO_CURSOR_TIMEOUT != 0
    }

    pub fn is_await_data(&self) -> bool {
        self.0 & Self::AWAIT_DATA != 0
    }

    pub fn is_exhaust(&self) -> bool {
        self.0 & Self::EXHAUST != 0
    }

    pub fn is_partial(&self) -> bool {
        self.0 & Self::PARTIAL != 0
    }
}

/// OP_REPLY response flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResponseFlags(u32);

impl ResponseFlags {
    /// The cursor id in the getMore was not found, killed, or timed out.
    pub const CURSOR_NOT_FOUND: u32 = 1 << 0;
    /// The query failed; the single returned document carries `$err`.
    pub const QUERY_FAILURE: u32 = 1 << 1;
    /// Routed topology: shard configuration is stale.
    pub const SHARD_CONFIG_STALE: u32 = 1 << 2;
    /// Server supports the await-data query flag.
    pub const AWAIT_CAPABLE: u32 = 1 << 3;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn with_cursor_not_found(mut self) -> Self {
        self.0 |= Self::CURSOR_NOT_FOUND;
        self
    }

    pub fn with_query_failure(mut self) -> Self {
        self.0 |= Self::QUERY_FAILURE;
        self
    }

    pub fn with_await_capable(mut self) -> Self {
        self.0 |= Self::AWAIT_CAPABLE;
        self
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.0 & Self::CURSOR_NOT_FOUND != 0
    }

    pub fn is_query_failure(&self) -> bool {
        self.0 & Self::QUERY_FAILURE != 0
    }

    pub fn is_shard_config_stale(&self) -> bool {
        self.0 & Self::SHARD_CONFIG_STALE != 0
    }

    pub fn is_await_capable(&self) -> bool {
        self.0 & Self::AWAIT_CAPABLE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_flag_bits() {
        assert_eq!(QueryFlags::new().with_tailable(true).bits(), 2);
        assert_eq!(QueryFlags::new().with_slave_ok(true).bits(), 4);
        assert_eq!(QueryFlags::new().with_oplog_replay(true).bits(), 8);
        assert_eq!(QueryFlags::new().with_no_cursor_timeout(true).bits(), 16);
        assert_eq!(QueryFlags::new().with_await_data(true).bits(), 32);
        assert_eq!(QueryFlags::new().with_exhaust(true).bits(), 64);
        assert_eq!(QueryFlags::new().with_partial(true).bits(), 128);
    }

    #[test]
    fn test_query_flags_toggle() {
        let flags = QueryFlags::new()
            .with_tailable(true)
            .with_await_data(true)
            .with_tailable(false);
        assert!(!flags.is_tailable());
        assert!(flags.is_await_data());
        assert!(!flags.is_partial());
    }

    #[test]
    fn test_response_flags() {
        let flags = ResponseFlags::from_bits(1 | 8);
        assert!(flags.is_cursor_not_found());
        assert!(flags.is_await_capable());
        assert!(!flags.is_query_failure());
        assert!(!flags.is_shard_config_stale());

        let flags = ResponseFlags::new().with_query_failure();
        assert_eq!(flags.bits(), 2);
    }
}
