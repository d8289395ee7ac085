//! Cashu ecash wallet core
//!
//! Custody of bearer proofs for a single owner: reservations, coin
//! selection, mint/melt quote lifecycles and token encoding. Mint protocol
//! calls and persistence are reached through the `MintConnector` and
//! `WalletDatabase` traits.

pub mod services;
pub mod stores;

pub use services::admission_policy::{
    AdmitStatus, AdmittedIdentity, IdentityAdmissionPolicy, IdentityClaims, IdentityVerifier, VerifyError,
};
pub use stores::cashu::errors::{CashuResult, CashuWalletError, ErrorKind};
pub use stores::cashu::types::*;
pub use stores::cashu::signals::{ReleaseReason, WalletEvent};
pub use stores::cashu_memory_db::{DatabaseError, MemoryDatabase, StoredWallet, WalletDatabase, WriteBatch};
pub use stores::cashu_mint_client::{
    MeltOutcome, MintClientError, MintClientResult, MintConnector, RemoteMeltQuote, RemoteMeltState,
    RemoteMintQuote, RemoteMintQuoteState, SpentState,
};
pub use stores::cashu_wallet::CashuWallet;
pub use stores::settings_store::{GatewaySettings, WalletSettings};
