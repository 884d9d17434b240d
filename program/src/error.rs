use solana_program::{
    decode_error::DecodeError, msg, program_error::PrintProgramError, program_error::ProgramError,
};
use thiserror::Error;

/// Errors that may be returned by the settlement program
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Operation attempted outside its valid lifecycle state
    #[error("Operation not valid in the current state")]
    InvalidState,

    /// Caller lacks the capability required by the operation
    #[error("Caller is not authorized for this operation")]
    Unauthorized,

    /// Price feed is older than the configured maximum age
    #[error("Price feed data is stale")]
    StaleOracleData,

    /// Randomness fulfillment for a consumed or unknown request
    #[error("Randomness request already consumed or unknown")]
    DuplicateCallback,

    /// Paid amount does not match the computed price
    #[error("Payment does not match the ticket price")]
    PriceMismatch,

    /// Claim after the deadline or reroll before it
    #[error("Claim deadline violated")]
    DeadlineViolation,

    /// Internal accounting identity broken
    #[error("Conservation invariant violated")]
    ConservationViolation,

    #[error("Account is not initialized")]
    NotInitialized,

    /// Supplied account does not match the expected address or record
    #[error("Account does not match the expected address")]
    AccountMismatch,

    #[error("Invalid membership tier")]
    InvalidTier,

    #[error("Price feed account is invalid")]
    InvalidPriceFeed,

    /// Compute-unit price above the configured ceiling
    #[error("Network congestion limit exceeded")]
    CongestionLimit,

    #[error("Not enough tickets available")]
    TicketsUnavailable,

    #[error("Ticket book is full")]
    TicketBookFull,

    #[error("No tickets were sold")]
    NoTicketsSold,

    #[error("No reward to claim")]
    NothingToClaim,

    #[error("Insufficient funds for operation")]
    InsufficientFunds,

    /// Revenue split basis points exceed 100%
    #[error("Invalid revenue split")]
    InvalidSplit,

    #[error("Arithmetic overflow")]
    MathOverflow,

    /// Randomness not backed by the authority's signature over the request seed
    #[error("Invalid randomness proof")]
    InvalidRandomnessProof,
}

impl From<SettlementError> for ProgramError {
    fn from(e: SettlementError) -> Self {
        ProgramError::Custom(e as u32)
    }
}

impl<T> DecodeError<T> for SettlementError {
    fn type_of() -> &'static str {
        "Settlement Error"
    }
}

impl PrintProgramError for SettlementError {
    fn print<E>(&self) {
        msg!(&self.to_string());
    }
}
