//! Test doubles
//!
//! `FakeMint` is a deterministic in-process mint: it issues proofs with
//! unique secrets, tracks which ones are spent, and lets a test script
//! payment detection, melt outcomes and swap failures. `FlakyDatabase`
//! wraps `MemoryDatabase` with switchable write failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::denomination::split_amount;
use super::errors::NutErrorCode;
use super::fees::calculate_proof_fee;
use super::types::{sum_amounts, CurrencyUnit, Proof};
use super::utils::now_secs;
use crate::stores::cashu_memory_db::{DatabaseError, MemoryDatabase, StoredWallet, WalletDatabase, WriteBatch};
use crate::stores::cashu_mint_client::{
    MeltOutcome, MintClientError, MintClientResult, MintConnector, RemoteMeltQuote, RemoteMeltState,
    RemoteMintQuote, RemoteMintQuoteState, SpentState,
};
use crate::stores::cashu_wallet::CashuWallet;
use crate::stores::settings_store::WalletSettings;

pub const TEST_MINT: &str = "https://mint.example.com";

const KEYSET_ID: &str = "00ad268c4d1f5826";
const QUOTE_LIFETIME_SECS: u64 = 3600;

// =============================================================================
// Scripted Behaviour
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeltBehavior {
    /// Pay immediately and return change
    Pay,
    /// Report the payment as failed; inputs stay unspent
    Fail,
    /// Leave the quote in the given state and time out the request
    TimeoutThen(RemoteMeltState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapBehavior {
    Ok,
    /// Reject with a non-spend protocol error
    Reject,
    /// Time out without touching the inputs
    TimeoutBeforeApply,
    /// Spend the inputs, then time out before answering
    TimeoutAfterApply,
}

struct FakeMintQuote {
    amount: u64,
    paid: bool,
    issued: bool,
}

struct FakeMeltQuote {
    amount: u64,
    fee_reserve: u64,
    state: RemoteMeltState,
    inputs: Vec<Proof>,
    fee_paid: u64,
    change: Vec<Proof>,
}

struct State {
    next_id: u64,
    mint_quotes: HashMap<String, FakeMintQuote>,
    melt_quotes: HashMap<String, FakeMeltQuote>,
    /// invoice -> (amount, fee reserve)
    invoices: HashMap<String, (u64, u64)>,
    spent: HashSet<String>,
    pending: HashSet<String>,
    melt_fee: u64,
    input_fee_ppk: u64,
    melt_behavior: MeltBehavior,
    swap_behavior: SwapBehavior,
    swap_delay: Duration,
    offline: bool,
    mint_calls: usize,
    melt_calls: usize,
    swap_calls: usize,
}

pub struct FakeMint {
    state: Mutex<State>,
}

impl FakeMint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 1,
                mint_quotes: HashMap::new(),
                melt_quotes: HashMap::new(),
                invoices: HashMap::new(),
                spent: HashSet::new(),
                pending: HashSet::new(),
                melt_fee: 0,
                input_fee_ppk: 0,
                melt_behavior: MeltBehavior::Pay,
                swap_behavior: SwapBehavior::Ok,
                swap_delay: Duration::ZERO,
                offline: false,
                mint_calls: 0,
                melt_calls: 0,
                swap_calls: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// Simulate the Lightning invoice of a mint quote being paid
    pub fn pay_quote(&self, quote_id: &str) {
        if let Some(quote) = self.lock().mint_quotes.get_mut(quote_id) {
            quote.paid = true;
        }
    }

    /// Register a payable invoice and return it
    pub fn invoice(&self, amount: u64, fee_reserve: u64) -> String {
        let mut state = self.lock();
        let n = state.next();
        let invoice = format!("lnbc{}n1fake{}", amount, n);
        state.invoices.insert(invoice.clone(), (amount, fee_reserve));
        invoice
    }

    /// Lightning fee the mint actually charges, capped at the reserve
    pub fn set_melt_fee(&self, fee: u64) {
        self.lock().melt_fee = fee;
    }

    pub fn set_input_fee_ppk(&self, ppk: u64) {
        self.lock().input_fee_ppk = ppk;
    }

    pub fn set_melt_behavior(&self, behavior: MeltBehavior) {
        self.lock().melt_behavior = behavior;
    }

    pub fn set_swap_behavior(&self, behavior: SwapBehavior) {
        self.lock().swap_behavior = behavior;
    }

    pub fn set_swap_delay(&self, delay: Duration) {
        self.lock().swap_delay = delay;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Resolve a melt left in flight
    pub fn settle_melt(&self, quote_id: &str, outcome: RemoteMeltState) {
        let mut state = self.lock();
        state.resolve_melt(quote_id, outcome);
    }

    /// Issue proofs outside any quote, e.g. to build a token for receiving
    pub fn issue(&self, mint_url: &str, amounts: &[u64]) -> Vec<Proof> {
        let mut state = self.lock();
        amounts.iter().map(|a| state.new_proof(mint_url, *a)).collect()
    }

    /// Spend proofs from another wallet holding copies
    pub fn spend_externally(&self, secrets: &[String]) {
        self.lock().spent.extend(secrets.iter().cloned());
    }

    pub fn mint_calls(&self) -> usize {
        self.lock().mint_calls
    }

    pub fn melt_calls(&self) -> usize {
        self.lock().melt_calls
    }

    pub fn swap_calls(&self) -> usize {
        self.lock().swap_calls
    }
}

impl State {
    fn next(&mut self) -> u64 {
        let n = self.next_id;
        self.next_id += 1;
        n
    }

    fn new_proof(&mut self, mint_url: &str, amount: u64) -> Proof {
        let n = self.next();
        Proof {
            id: KEYSET_ID.to_string(),
            amount,
            secret: format!("{}{:016x}", uuid::Uuid::new_v4().simple(), n),
            c: format!("02{:064x}", n),
            mint_url: mint_url.to_string(),
        }
    }

    fn check_offline(&self) -> MintClientResult<()> {
        if self.offline {
            return Err(MintClientError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    /// Inputs must be unspent, not in flight and distinct
    fn check_inputs(&self, inputs: &[Proof]) -> MintClientResult<()> {
        let mut seen = HashSet::new();
        for proof in inputs {
            if self.spent.contains(&proof.secret) {
                return Err(reject(NutErrorCode::TokenAlreadySpent, "proof already spent"));
            }
            if self.pending.contains(&proof.secret) {
                return Err(reject(NutErrorCode::TokenPending, "proof pending"));
            }
            if !seen.insert(proof.secret.as_str()) {
                return Err(reject(NutErrorCode::DuplicateInputs, "duplicate inputs"));
            }
        }
        Ok(())
    }

    fn spend(&mut self, inputs: &[Proof]) {
        for proof in inputs {
            self.pending.remove(&proof.secret);
            self.spent.insert(proof.secret.clone());
        }
    }

    fn resolve_melt(&mut self, quote_id: &str, outcome: RemoteMeltState) {
        let Some(quote) = self.melt_quotes.get(quote_id) else {
            return;
        };
        let inputs = quote.inputs.clone();
        let (amount, fee_reserve) = (quote.amount, quote.fee_reserve);

        match outcome {
            RemoteMeltState::Paid => {
                self.spend(&inputs);
                let fee_paid = self.melt_fee.min(fee_reserve);
                let total = sum_amounts(&inputs).unwrap_or(0);
                let input_fee = calculate_proof_fee(inputs.len(), self.input_fee_ppk);
                let change_amount = total
                    .saturating_sub(input_fee)
                    .saturating_sub(amount)
                    .saturating_sub(fee_paid);
                let change: Vec<Proof> = split_amount(change_amount)
                    .into_iter()
                    .map(|a| self.new_proof("", a))
                    .collect();
                if let Some(quote) = self.melt_quotes.get_mut(quote_id) {
                    quote.state = RemoteMeltState::Paid;
                    quote.fee_paid = fee_paid;
                    quote.change = change;
                }
            }
            RemoteMeltState::Pending => {
                self.pending.extend(inputs.iter().map(|p| p.secret.clone()));
                if let Some(quote) = self.melt_quotes.get_mut(quote_id) {
                    quote.state = RemoteMeltState::Pending;
                }
            }
            RemoteMeltState::Failed | RemoteMeltState::Unpaid => {
                for proof in &inputs {
                    self.pending.remove(&proof.secret);
                }
                if let Some(quote) = self.melt_quotes.get_mut(quote_id) {
                    quote.state = outcome;
                }
            }
        }
    }

    fn melt_outcome(&self, quote_id: &str) -> MintClientResult<MeltOutcome> {
        let quote = self
            .melt_quotes
            .get(quote_id)
            .ok_or_else(|| reject(NutErrorCode::Unknown, "unknown quote"))?;
        Ok(MeltOutcome {
            state: quote.state,
            fee_paid: quote.fee_paid,
            preimage: (quote.state == RemoteMeltState::Paid).then(|| format!("preimage-{}", quote_id)),
            change: quote.change.clone(),
        })
    }
}

fn reject(code: NutErrorCode, message: &str) -> MintClientError {
    MintClientError::rejected(code.code(), message)
}

#[async_trait]
impl MintConnector for FakeMint {
    async fn request_mint_quote(
        &self,
        _mint_url: &str,
        amount: u64,
        _unit: &CurrencyUnit,
        _description: Option<&str>,
    ) -> MintClientResult<RemoteMintQuote> {
        let mut state = self.lock();
        state.check_offline()?;
        let n = state.next();
        let quote_id = format!("mint-quote-{}", n);
        state.mint_quotes.insert(
            quote_id.clone(),
            FakeMintQuote {
                amount,
                paid: false,
                issued: false,
            },
        );
        Ok(RemoteMintQuote {
            quote_id,
            payment_request: format!("lnbc{}n1mint{}", amount, n),
            amount,
            state: RemoteMintQuoteState::Unpaid,
            expiry: Some(now_secs() + QUOTE_LIFETIME_SECS),
        })
    }

    async fn mint_quote_state(&self, _mint_url: &str, quote_id: &str) -> MintClientResult<RemoteMintQuote> {
        let state = self.lock();
        state.check_offline()?;
        let quote = state
            .mint_quotes
            .get(quote_id)
            .ok_or_else(|| reject(NutErrorCode::Unknown, "unknown quote"))?;
        let remote_state = if quote.issued {
            RemoteMintQuoteState::Issued
        } else if quote.paid {
            RemoteMintQuoteState::Paid
        } else {
            RemoteMintQuoteState::Unpaid
        };
        Ok(RemoteMintQuote {
            quote_id: quote_id.to_string(),
            payment_request: String::new(),
            amount: quote.amount,
            state: remote_state,
            expiry: None,
        })
    }

    async fn mint(&self, mint_url: &str, quote_id: &str, amounts: &[u64]) -> MintClientResult<Vec<Proof>> {
        let mut state = self.lock();
        state.check_offline()?;
        state.mint_calls += 1;

        let quote = state
            .mint_quotes
            .get_mut(quote_id)
            .ok_or_else(|| reject(NutErrorCode::Unknown, "unknown quote"))?;
        if !quote.paid {
            return Err(reject(NutErrorCode::QuoteNotPaid, "quote not paid"));
        }
        if quote.issued {
            return Err(reject(NutErrorCode::BlindedMessageAlreadySigned, "already issued"));
        }
        if amounts.iter().sum::<u64>() != quote.amount {
            return Err(reject(NutErrorCode::TransactionUnbalanced, "outputs do not match quote"));
        }
        quote.issued = true;

        Ok(amounts.iter().map(|a| state.new_proof(mint_url, *a)).collect())
    }

    async fn request_melt_quote(
        &self,
        _mint_url: &str,
        invoice: &str,
        _unit: &CurrencyUnit,
    ) -> MintClientResult<RemoteMeltQuote> {
        let mut state = self.lock();
        state.check_offline()?;
        let (amount, fee_reserve) = *state
            .invoices
            .get(invoice)
            .ok_or_else(|| reject(NutErrorCode::LightningError, "invalid invoice"))?;
        let n = state.next();
        let quote_id = format!("melt-quote-{}", n);
        state.melt_quotes.insert(
            quote_id.clone(),
            FakeMeltQuote {
                amount,
                fee_reserve,
                state: RemoteMeltState::Unpaid,
                inputs: Vec::new(),
                fee_paid: 0,
                change: Vec::new(),
            },
        );
        Ok(RemoteMeltQuote {
            quote_id,
            amount,
            fee_reserve,
            state: RemoteMeltState::Unpaid,
            expiry: Some(now_secs() + QUOTE_LIFETIME_SECS),
        })
    }

    async fn melt(&self, _mint_url: &str, quote_id: &str, inputs: &[Proof]) -> MintClientResult<MeltOutcome> {
        let mut state = self.lock();
        state.check_offline()?;
        state.melt_calls += 1;
        state.check_inputs(inputs)?;

        let quote = state
            .melt_quotes
            .get_mut(quote_id)
            .ok_or_else(|| reject(NutErrorCode::Unknown, "unknown quote"))?;
        if quote.state != RemoteMeltState::Unpaid {
            return Err(reject(NutErrorCode::InvoiceAlreadyPaid, "quote already used"));
        }
        let required = quote.amount + quote.fee_reserve;
        if sum_amounts(inputs).unwrap_or(0) < required {
            return Err(reject(NutErrorCode::TransactionUnbalanced, "inputs below amount plus reserve"));
        }
        quote.inputs = inputs.to_vec();

        match state.melt_behavior {
            MeltBehavior::Pay => {
                state.resolve_melt(quote_id, RemoteMeltState::Paid);
                state.melt_outcome(quote_id)
            }
            MeltBehavior::Fail => {
                state.resolve_melt(quote_id, RemoteMeltState::Failed);
                state.melt_outcome(quote_id)
            }
            MeltBehavior::TimeoutThen(outcome) => {
                state.resolve_melt(quote_id, outcome);
                Err(MintClientError::Timeout)
            }
        }
    }

    async fn melt_quote_state(&self, _mint_url: &str, quote_id: &str) -> MintClientResult<MeltOutcome> {
        let state = self.lock();
        state.check_offline()?;
        state.melt_outcome(quote_id)
    }

    async fn swap(&self, mint_url: &str, inputs: &[Proof], target_amounts: &[u64]) -> MintClientResult<Vec<Proof>> {
        let delay = {
            let mut state = self.lock();
            state.check_offline()?;
            state.swap_calls += 1;
            state.swap_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        match state.swap_behavior {
            SwapBehavior::Reject => {
                return Err(reject(NutErrorCode::TransactionUnbalanced, "swap rejected"));
            }
            SwapBehavior::TimeoutBeforeApply => return Err(MintClientError::Timeout),
            SwapBehavior::Ok | SwapBehavior::TimeoutAfterApply => {}
        }
        state.check_inputs(inputs)?;

        let input_total = sum_amounts(inputs).unwrap_or(0);
        let fee = calculate_proof_fee(inputs.len(), state.input_fee_ppk);
        let output_total: u64 = target_amounts.iter().sum();
        if input_total.checked_sub(fee) != Some(output_total) {
            return Err(reject(NutErrorCode::TransactionUnbalanced, "inputs minus fee != outputs"));
        }

        state.spend(inputs);
        let outputs: Vec<Proof> = target_amounts
            .iter()
            .map(|a| state.new_proof(mint_url, *a))
            .collect();

        if state.swap_behavior == SwapBehavior::TimeoutAfterApply {
            return Err(MintClientError::Timeout);
        }
        Ok(outputs)
    }

    async fn check_spent(&self, _mint_url: &str, proofs: &[Proof]) -> MintClientResult<Vec<SpentState>> {
        let state = self.lock();
        state.check_offline()?;
        Ok(proofs
            .iter()
            .map(|p| {
                if state.spent.contains(&p.secret) {
                    SpentState::Spent
                } else if state.pending.contains(&p.secret) {
                    SpentState::Pending
                } else {
                    SpentState::Unspent
                }
            })
            .collect())
    }
}

// =============================================================================
// Storage Double
// =============================================================================

/// `MemoryDatabase` whose writes can be made to fail or stall
#[derive(Clone, Default)]
pub struct FlakyDatabase {
    db: MemoryDatabase,
    fail_writes: Arc<AtomicBool>,
    write_delay_ms: Arc<AtomicU64>,
}

impl FlakyDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletDatabase for FlakyDatabase {
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DatabaseError("injected write failure".to_string()));
        }
        self.db.write_batch(batch).await
    }

    async fn load(&self) -> Result<StoredWallet, DatabaseError> {
        self.db.load().await
    }
}

// =============================================================================
// Wallet Helpers
// =============================================================================

pub fn test_settings() -> WalletSettings {
    WalletSettings {
        network_timeout_secs: 5,
        read_retry_base_delay_ms: 1,
        ..WalletSettings::for_mint(TEST_MINT)
    }
}

pub fn test_wallet(mint: &Arc<FakeMint>) -> (CashuWallet, MemoryDatabase) {
    let db = MemoryDatabase::new();
    let wallet = test_wallet_with_db(mint, db.clone());
    (wallet, db)
}

pub fn test_wallet_with_db(mint: &Arc<FakeMint>, db: impl WalletDatabase + 'static) -> CashuWallet {
    CashuWallet::new(test_settings(), mint.clone(), Arc::new(db)).unwrap()
}

pub fn test_wallet_with_settings(mint: &Arc<FakeMint>, settings: WalletSettings) -> CashuWallet {
    CashuWallet::new(settings, mint.clone(), Arc::new(MemoryDatabase::new())).unwrap()
}

/// Mint `amount` into the wallet through a paid quote
pub async fn fund_wallet(wallet: &CashuWallet, mint: &Arc<FakeMint>, amount: u64) {
    let info = wallet.receive_funds(amount, "test funding").await.unwrap();
    mint.pay_quote(&info.quote_id);
    assert_eq!(wallet.complete_mint(&info.quote_id).await.unwrap(), amount);
}
