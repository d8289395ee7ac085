// Wallet state
// Stores own the mutable custody state and its collaborators

pub mod settings_store;
pub mod cashu;
pub mod cashu_wallet;
pub mod cashu_mint_client;
pub mod cashu_memory_db;
