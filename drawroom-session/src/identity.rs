//! Guest identity allocation and participant-name validation.
//!
//! A room creator without an authenticated identity becomes [`DEFAULT_OWNER`].
//! Later anonymous joiners get `guest<N>` where `N` is one past the highest
//! numeric suffix already in the room, starting at 2. When that would
//! overflow, the lowest free suffix from 2 up is used instead.

use std::collections::HashSet;

use crate::error::SessionError;
use crate::room::ParticipantId;

/// Identity given to a room creator that has no authenticated identity.
pub const DEFAULT_OWNER: &str = "guest1";

const GUEST_PREFIX: &str = "guest";
const FIRST_ALLOCATED_GUEST: u64 = 2;

/// Longest caller-supplied guest name accepted on join.
pub const MAX_GUEST_NAME_LEN: usize = 32;

/// Numeric suffix of a well-formed guest identity (`guest` + ASCII digits).
///
/// Returns `None` for anything else, including suffixes too large for `u64`.
pub fn guest_number(identity: &str) -> Option<u64> {
    let digits = identity.strip_prefix(GUEST_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Allocate the next guest identity for a room's participant list.
pub fn next_guest_id<'a, I>(participants: I) -> ParticipantId
where
    I: IntoIterator<Item = &'a ParticipantId>,
{
    let taken: HashSet<u64> = participants
        .into_iter()
        .filter_map(|p| guest_number(p))
        .collect();
    let next = match taken.iter().max() {
        None => FIRST_ALLOCATED_GUEST,
        Some(&max) => max
            .checked_add(1)
            .unwrap_or_else(|| lowest_free_guest(&taken)),
    };
    format!("{GUEST_PREFIX}{next}")
}

fn lowest_free_guest(taken: &HashSet<u64>) -> u64 {
    (FIRST_ALLOCATED_GUEST..)
        .find(|n| !taken.contains(n))
        .unwrap_or(FIRST_ALLOCATED_GUEST)
}

/// Validate a caller-chosen guest name: 1..=32 chars of `[A-Za-z0-9_-]`.
pub fn validate_guest_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty() {
        return Err(SessionError::validation("guest name must not be empty"));
    }
    if name.len() > MAX_GUEST_NAME_LEN {
        return Err(SessionError::validation(format!(
            "guest name longer than {MAX_GUEST_NAME_LEN} characters"
        )));
    }
    if !name.bytes().all(is_name_byte) {
        return Err(SessionError::validation(format!(
            "guest name '{name}' contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

pub(crate) fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Trimmed identity, or `None` when absent or blank.
pub(crate) fn non_blank(identity: Option<&str>) -> Option<&str> {
    identity.map(str::trim).filter(|s| !s.is_empty())
}
