//! Ticket-style queue arithmetic.
//!
//! A queue entry's `position` is a ticket number: it is assigned once as
//! `max(existing) + 1` and never renumbered when earlier entries are served.
//! The number of people still ahead is the *live rank*, computed on read.

use crate::models::{QueueEntry, QueueStatus};

pub const DEFAULT_SLOT_MINUTES: u32 = 5;

/// Next ticket number: one past the highest ever issued, starting at 1.
pub fn next_position<I>(existing_positions: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    existing_positions.into_iter().max().unwrap_or(0) + 1
}

pub fn estimated_wait_minutes(position: u32, slot_minutes: u32) -> u32 {
    position.saturating_mul(slot_minutes)
}

/// Count of WAITING entries holding a smaller ticket than `entry`.
pub fn live_rank<'a, I>(entry: &QueueEntry, entries: I) -> u32
where
    I: IntoIterator<Item = &'a QueueEntry>,
{
    entries
        .into_iter()
        .filter(|other| other.status == QueueStatus::Waiting && other.position < entry.position)
        .count() as u32
}

/// Wait estimate from the live rank: the entry itself occupies one slot.
pub fn live_wait_minutes(live_rank: u32, slot_minutes: u32) -> u32 {
    live_rank.saturating_add(1).saturating_mul(slot_minutes)
}
