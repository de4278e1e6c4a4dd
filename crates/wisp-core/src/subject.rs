//! Subject validation and inbox naming
//!
//! Subjects are dotted hierarchical names (`a.b.c`). Wildcard resolution is
//! a server-side concern; the client only rejects names that can never be
//! valid on the wire (whitespace would break the line framing).

use crate::nuid;

/// Reserved namespace prefix for reply-routing subjects
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Check whether a subject is safe to put on the wire.
///
/// A valid subject is non-empty, contains no whitespace or control
/// characters, and has no empty tokens.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    if subject
        .bytes()
        .any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' || b < 0x20)
    {
        return false;
    }
    !subject.split('.').any(str::is_empty)
}

/// Allocate a fresh inbox subject: `_INBOX.<nuid>`
pub fn new_inbox() -> String {
    format!("{}{}", INBOX_PREFIX, nuid::next())
}
