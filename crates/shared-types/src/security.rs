//! # Input Security
//!
//! Checks applied to identifiers received from remote peers, and the
//! sanitizer used before any peer-controlled string reaches a log line.

use crate::errors::InputError;

/// Length of a hex-encoded workflow ID (32 bytes).
pub const WORKFLOW_ID_LEN: usize = 64;

/// Longest peer-supplied string written to logs.
pub const MAX_LOGGED_STRING_LEN: usize = 256;

/// Longest accepted executable message ID.
pub const MAX_MESSAGE_ID_LEN: usize = 256;

/// Validate a workflow ID: exactly 64 hex characters.
pub fn validate_workflow_id(id: &str) -> Result<(), InputError> {
    if id.is_empty() {
        return Err(InputError::EmptyWorkflowId);
    }
    if id.len() != WORKFLOW_ID_LEN {
        return Err(InputError::WorkflowIdLength {
            expected: WORKFLOW_ID_LEN,
            actual: id.len(),
        });
    }
    if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(InputError::WorkflowIdNotHex);
    }
    Ok(())
}

/// Validate an executable message ID: non-empty printable ASCII without
/// whitespace, at most [`MAX_MESSAGE_ID_LEN`] bytes.
pub fn validate_message_id(id: &str) -> Result<(), InputError> {
    if id.is_empty() || id.len() > MAX_MESSAGE_ID_LEN {
        return Err(InputError::InvalidMessageId);
    }
    if !id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(InputError::InvalidMessageId);
    }
    Ok(())
}

/// Make a peer-controlled string safe to log.
///
/// Long strings are truncated. A string containing control or non-ASCII
/// characters is logged as hex so it cannot forge log lines.
pub fn sanitize_log_string(s: &str) -> String {
    let (head, suffix) = if s.len() > MAX_LOGGED_STRING_LEN {
        (&s.as_bytes()[..MAX_LOGGED_STRING_LEN], " [TRUNCATED]")
    } else {
        (s.as_bytes(), "")
    };
    if head.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        // All bytes are ASCII, so this is valid UTF-8.
        format!("{}{}", String::from_utf8_lossy(head), suffix)
    } else {
        format!("[UNPRINTABLE] {}{}", hex::encode(head), suffix)
    }
}
