//! Shared hard limits to prevent unbounded allocations or payload growth.
//!
//! This module centralizes:
//! - Type-id partitioning for the driver registry
//! - Handle table sizing
//! - Field, name and message size limits
//! - Callback timing

use std::time::Duration;

// =============================================================================
// Driver Registry
// =============================================================================

/// First type id of the dynamic range.
///
/// Static type ids live in `[0, DYNAMIC_TYPE_BASE)`. Drivers registered with a
/// negative type id receive the next value of a counter seeded here.
pub const DYNAMIC_TYPE_BASE: i64 = 1_000_000;

/// Number of standard fields every record type carries at the start of its
/// field array (name, taxonomy, label, ACL, precision, resynchronize).
pub const MIN_STANDARD_FIELDS: usize = 8;

// =============================================================================
// Handle Tables
// =============================================================================

/// Slots per block in the record handle table.
pub const RECORD_HANDLE_BLOCK_SIZE: usize = 100;

/// Records per preallocated handle block (`ceil(records / 100)` blocks).
pub const RECORDS_PER_HANDLE_BLOCK: usize = 100;

/// Slots per block in the callback handle table.
pub const CALLBACK_HANDLE_BLOCK_SIZE: usize = 100;

/// Initial number of callback handle blocks.
pub const CALLBACK_HANDLE_NUM_BLOCKS: usize = 1;

/// Largest handle value that fits in a wire message id.
///
/// The top bit of a message id marks callback traffic, so handles must stay
/// below it.
pub const MAX_HANDLE: usize = 0x7fff_ffff;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum record name length in bytes.
pub const MAX_RECORD_NAME_LENGTH: usize = 40;

/// Maximum field name length in bytes.
pub const MAX_FIELD_NAME_LENGTH: usize = 40;

/// Maximum record label length in bytes.
pub const MAX_LABEL_LENGTH: usize = 40;

/// Maximum ACL description length in bytes.
pub const MAX_ACL_DESCRIPTION_LENGTH: usize = 40;

/// Maximum user or program name a client may announce.
pub const MAX_CLIENT_NAME_LENGTH: usize = 40;

/// Maximum total length of one wire message (header included).
pub const MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

// =============================================================================
// Timing
// =============================================================================

/// Default interval of the value-changed poll timer.
pub const CALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default capacity of the callback channel.
pub const CALLBACK_QUEUE_CAPACITY: usize = 1024;

/// Number of handle blocks recommended for a database of `num_records`
/// records: `ceil(num_records / 100)`, and never fewer than one.
pub fn handle_blocks_for_records(num_records: usize) -> usize {
    num_records.div_ceil(RECORDS_PER_HANDLE_BLOCK).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_blocks_round_up() {
        assert_eq!(handle_blocks_for_records(0), 1);
        assert_eq!(handle_blocks_for_records(1), 1);
        assert_eq!(handle_blocks_for_records(100), 1);
        assert_eq!(handle_blocks_for_records(101), 2);
        assert_eq!(handle_blocks_for_records(950), 10);
    }
}
