// Wallets and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{Wallet, Wallets};
pub use tx_builder::new_transfer;
