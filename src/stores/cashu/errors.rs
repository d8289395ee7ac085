//! Cashu wallet error types
//!
//! Typed error handling so callers can branch on the failure kind.
//! Includes the NUT-00 error codes returned by mints.

use std::fmt;

use super::types::{CurrencyUnit, ReservationId};

// =============================================================================
// NUT Error Codes (NUT-00)
// =============================================================================

/// NUT error codes returned by Cashu mints
/// These map to standardized error responses from mints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NutErrorCode {
    /// Token already spent
    TokenAlreadySpent = 11001,
    /// Token pending (locked in transaction)
    TokenPending = 11002,
    /// Transaction unbalanced (inputs != outputs + fee)
    TransactionUnbalanced = 11003,
    /// Unit not supported by mint
    UnsupportedUnit = 11004,
    /// Minting disabled
    MintingDisabled = 11005,
    /// Quote not paid
    QuoteNotPaid = 11006,
    /// Quote expired
    QuoteExpired = 11007,
    /// Quote pending
    QuotePending = 11008,
    /// Blinded message already signed
    BlindedMessageAlreadySigned = 11009,
    /// Amount out of limit range
    AmountOutOfLimitRange = 11010,
    /// Duplicate inputs
    DuplicateInputs = 11011,
    /// Lightning error
    LightningError = 20001,
    /// Invoice already paid
    InvoiceAlreadyPaid = 20002,
    /// Unknown/generic error
    Unknown = 65535,
}

impl NutErrorCode {
    /// Create from numeric code
    pub fn from_code(code: u16) -> Self {
        match code {
            11001 => Self::TokenAlreadySpent,
            11002 => Self::TokenPending,
            11003 => Self::TransactionUnbalanced,
            11004 => Self::UnsupportedUnit,
            11005 => Self::MintingDisabled,
            11006 => Self::QuoteNotPaid,
            11007 => Self::QuoteExpired,
            11008 => Self::QuotePending,
            11009 => Self::BlindedMessageAlreadySigned,
            11010 => Self::AmountOutOfLimitRange,
            11011 => Self::DuplicateInputs,
            20001 => Self::LightningError,
            20002 => Self::InvoiceAlreadyPaid,
            _ => Self::Unknown,
        }
    }

    /// Get numeric code value
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if error indicates the submitted inputs are unusable
    pub fn is_token_lost(&self) -> bool {
        matches!(
            self,
            Self::TokenAlreadySpent | Self::BlindedMessageAlreadySigned
        )
    }
}

impl fmt::Display for NutErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenAlreadySpent => write!(f, "Token already spent (11001)"),
            Self::TokenPending => write!(f, "Token pending (11002)"),
            Self::TransactionUnbalanced => write!(f, "Transaction unbalanced (11003)"),
            Self::UnsupportedUnit => write!(f, "Unsupported unit (11004)"),
            Self::MintingDisabled => write!(f, "Minting disabled (11005)"),
            Self::QuoteNotPaid => write!(f, "Quote not paid (11006)"),
            Self::QuoteExpired => write!(f, "Quote expired (11007)"),
            Self::QuotePending => write!(f, "Quote pending (11008)"),
            Self::BlindedMessageAlreadySigned => write!(f, "Blinded message already signed (11009)"),
            Self::AmountOutOfLimitRange => write!(f, "Amount out of limit range (11010)"),
            Self::DuplicateInputs => write!(f, "Duplicate inputs (11011)"),
            Self::LightningError => write!(f, "Lightning error (20001)"),
            Self::InvoiceAlreadyPaid => write!(f, "Invoice already paid (20002)"),
            Self::Unknown => write!(f, "Unknown error (65535)"),
        }
    }
}

// =============================================================================
// Error Kinds
// =============================================================================

/// Copyable discriminant of `CashuWalletError` for branching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InsufficientFunds,
    InsufficientFundsAfterFees,
    InvalidAmount,
    QuoteExpired,
    QuoteNotFound,
    QuoteNotReady,
    QuoteFailed,
    InvalidQuoteTransition,
    AmbiguousSettlement,
    TokenAlreadySpent,
    ForeignMint,
    UnitMismatch,
    MalformedToken,
    UnsupportedVersion,
    ReservationNotFound,
    MintNotFound,
    MintHasFunds,
    MintRejected,
    StorageUnavailable,
    NetworkUnavailable,
    InvalidConfig,
    Cancelled,
    Internal,
}

/// Cashu wallet error type
#[derive(Debug, Clone, PartialEq)]
pub enum CashuWalletError {
    // ==========================================================================
    // Funds Errors
    // ==========================================================================
    InsufficientFunds { available: u64, required: u64 },
    /// Target alone is coverable but target plus fees is not
    InsufficientFundsAfterFees { available: u64, required: u64, fee: u64 },
    InvalidAmount(String),

    // ==========================================================================
    // Quote Errors
    // ==========================================================================
    QuoteNotFound { quote_id: String },
    QuoteExpired { quote_id: String },
    QuoteNotReady { quote_id: String, state: String },
    QuoteFailed { quote_id: String, reason: String },
    InvalidQuoteTransition { quote_id: String, from: String, event: String },
    /// Melt outcome unresolved; proofs stay reserved until reconciliation
    AmbiguousSettlement { quote_id: String },

    // ==========================================================================
    // Token Errors
    // ==========================================================================
    TokenAlreadySpent,
    ForeignMint { mint_url: String },
    UnitMismatch { expected: CurrencyUnit, actual: CurrencyUnit },
    MalformedToken { reason: String },
    UnsupportedVersion { version: String },

    // ==========================================================================
    // Custody Errors
    // ==========================================================================
    ReservationNotFound { reservation_id: ReservationId },
    MintNotFound { mint_url: String },
    MintHasFunds { mint_url: String, amount: u64 },

    // ==========================================================================
    // Collaborator Errors
    // ==========================================================================
    MintRejected { code: NutErrorCode, message: String },
    StorageUnavailable(String),
    NetworkUnavailable(String),

    // ==========================================================================
    // Internal Errors
    // ==========================================================================
    InvalidConfig(String),
    Cancelled,
    Internal(String),
}

impl fmt::Display for CashuWalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds { available, required } => {
                write!(f, "Insufficient funds: available={}, required={}", available, required)
            }
            Self::InsufficientFundsAfterFees { available, required, fee } => write!(
                f,
                "Insufficient funds after fees: available={}, required={}, fee={}",
                available, required, fee
            ),
            Self::InvalidAmount(msg) => write!(f, "Invalid amount: {}", msg),

            Self::QuoteNotFound { quote_id } => write!(f, "Quote not found: {}", quote_id),
            Self::QuoteExpired { quote_id } => write!(f, "Quote expired: {}", quote_id),
            Self::QuoteNotReady { quote_id, state } => {
                write!(f, "Quote {} not ready (state: {})", quote_id, state)
            }
            Self::QuoteFailed { quote_id, reason } => {
                write!(f, "Quote {} failed: {}", quote_id, reason)
            }
            Self::InvalidQuoteTransition { quote_id, from, event } => write!(
                f,
                "Quote {} cannot apply {} from state {}",
                quote_id, event, from
            ),
            Self::AmbiguousSettlement { quote_id } => write!(
                f,
                "Settlement of melt quote {} is unresolved; reconciliation required",
                quote_id
            ),

            Self::TokenAlreadySpent => write!(f, "Token already spent"),
            Self::ForeignMint { mint_url } => write!(f, "Token from untrusted mint: {}", mint_url),
            Self::UnitMismatch { expected, actual } => {
                write!(f, "Unit mismatch: expected {}, got {}", expected, actual)
            }
            Self::MalformedToken { reason } => write!(f, "Malformed token: {}", reason),
            Self::UnsupportedVersion { version } => {
                write!(f, "Unsupported token version: {}", version)
            }

            Self::ReservationNotFound { reservation_id } => {
                write!(f, "Reservation not found: {}", reservation_id)
            }
            Self::MintNotFound { mint_url } => write!(f, "Mint not found: {}", mint_url),
            Self::MintHasFunds { mint_url, amount } => write!(
                f,
                "Mint {} still holds {} in unspent or reserved proofs",
                mint_url, amount
            ),

            Self::MintRejected { code, message } => {
                write!(f, "Mint rejected request: {} ({})", message, code)
            }
            Self::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            Self::NetworkUnavailable(msg) => write!(f, "Network unavailable: {}", msg),

            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for CashuWalletError {}

/// Result type alias for cashu wallet operations
pub type CashuResult<T> = Result<T, CashuWalletError>;

impl CashuWalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::InsufficientFundsAfterFees { .. } => ErrorKind::InsufficientFundsAfterFees,
            Self::InvalidAmount(_) => ErrorKind::InvalidAmount,
            Self::QuoteNotFound { .. } => ErrorKind::QuoteNotFound,
            Self::QuoteExpired { .. } => ErrorKind::QuoteExpired,
            Self::QuoteNotReady { .. } => ErrorKind::QuoteNotReady,
            Self::QuoteFailed { .. } => ErrorKind::QuoteFailed,
            Self::InvalidQuoteTransition { .. } => ErrorKind::InvalidQuoteTransition,
            Self::AmbiguousSettlement { .. } => ErrorKind::AmbiguousSettlement,
            Self::TokenAlreadySpent => ErrorKind::TokenAlreadySpent,
            Self::ForeignMint { .. } => ErrorKind::ForeignMint,
            Self::UnitMismatch { .. } => ErrorKind::UnitMismatch,
            Self::MalformedToken { .. } => ErrorKind::MalformedToken,
            Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Self::ReservationNotFound { .. } => ErrorKind::ReservationNotFound,
            Self::MintNotFound { .. } => ErrorKind::MintNotFound,
            Self::MintHasFunds { .. } => ErrorKind::MintHasFunds,
            Self::MintRejected { .. } => ErrorKind::MintRejected,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient collaborator failures that idempotent reads may retry
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::NetworkUnavailable(_))
    }

    /// Errors for which no retry of the same request changes the outcome
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable_read() && !matches!(self, Self::AmbiguousSettlement { .. })
    }

    /// Check if this is an insufficient funds error
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. } | Self::InsufficientFundsAfterFees { .. }
        )
    }

    /// Check if this error indicates tokens are already spent
    pub fn is_token_spent(&self) -> bool {
        matches!(
            self,
            Self::TokenAlreadySpent
                | Self::MintRejected {
                    code: NutErrorCode::TokenAlreadySpent,
                    ..
                }
        )
    }

    /// Get NUT error code if applicable
    pub fn nut_error_code(&self) -> Option<NutErrorCode> {
        match self {
            Self::TokenAlreadySpent => Some(NutErrorCode::TokenAlreadySpent),
            Self::QuoteExpired { .. } => Some(NutErrorCode::QuoteExpired),
            Self::MintRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
