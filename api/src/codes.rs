//! JSON-RPC error codes returned by the lifecycle service.

pub const NOT_FOUND: i32 = -32004;
pub const FORBIDDEN: i32 = -32003;
pub const INVALID_STATE: i32 = -32009;
pub const CONFLICT: i32 = -32010;
pub const DUPLICATE_BID: i32 = -32011;
/// Another ledger operation is in flight for the job.
pub const LEDGER_PENDING: i32 = -32012;
pub const LEDGER_UNAVAILABLE: i32 = -32020;
pub const LEDGER_REJECTED: i32 = -32021;
pub const LEDGER_UNCERTAIN: i32 = -32022;
/// The job is frozen pending operator review.
pub const TEMPORARILY_UNAVAILABLE: i32 = -32030;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL: i32 = -32603;

/// Codes the caller may resolve by re-reading and re-issuing the command.
pub fn is_retryable(code: i32) -> bool {
    matches!(code, CONFLICT | LEDGER_UNAVAILABLE)
}
