//! # Remote Executables
//!
//! Request/response capabilities called across DONs.
//!
//! ```text
//! workflow DON                              capability DON
//! ExecutableClient ── Execute{message_id} ──► ExecutableServer
//!   (every member)                            F+1 identical requests from the
//!                                             caller DON ─► underlying.execute
//!                  ◄── Execute{response} ───  reply to every requester
//! F+1 identical responses ─► caller
//! ```
//!
//! Every workflow node running the same step derives the same message ID,
//! so servers can count how many caller DON members asked for it.

mod client;
mod server;


use shared_types::{
    validate_message_id, CapabilityRequest, ErrorCode, InputError, MessageBody, Method,
};

pub use client::ExecutableClient;
pub use server::ExecutableServer;

/// Result of one execution as carried on the wire: the encoded response,
/// or the error code and message a server replied with.
pub(crate) type Outcome = Result<Vec<u8>, (ErrorCode, String)>;

/// Message ID shared by every workflow node issuing `request`.
pub fn message_id(request: &CapabilityRequest) -> Result<String, InputError> {
    let execution_id = &request.metadata.workflow_execution_id;
    if execution_id.is_empty() {
        return Err(InputError::EmptyExecutionId);
    }
    let id = format!(
        "{}:{}:{}",
        Method::Execute,
        execution_id,
        request.metadata.reference_id
    );
    validate_message_id(&id)?;
    Ok(id)
}

pub(crate) fn outcome_of(body: &MessageBody) -> Outcome {
    if body.has_error() {
        Err((body.error, body.error_msg.clone()))
    } else {
        Ok(body.payload.clone())
    }
}
