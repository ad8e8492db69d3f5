// Key management

use crate::core::{address_from_pub_key_hash, hash160};
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use secp256k1::{Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Key pair plus the address derived from it
#[derive(Clone)]
pub struct Wallet {
    secret_key: SecretKey,
    /// Uncompressed point without the 0x04 prefix: x || y
    public_key: Vec<u8>,
}

impl Wallet {
    /// Generate a new key pair
    pub fn new() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = secret_key.public_key(&secp).serialize_uncompressed()[1..].to_vec();

        Self {
            secret_key,
            public_key,
        }
    }

    /// Restore from 32 raw secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_secret_key(SecretKey::from_slice(bytes)?))
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn pub_key_hash(&self) -> Vec<u8> {
        hash160(&self.public_key).to_vec()
    }

    pub fn address(&self) -> String {
        address_from_pub_key_hash(&self.pub_key_hash())
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// On-disk form of the wallet file
#[derive(Serialize, Deserialize, Default)]
struct WalletFile {
    /// address -> hex-encoded secret key
    keys: BTreeMap<String, String>,
}

/// Collection of wallets keyed by address, persisted as JSON
#[derive(Debug, Default)]
pub struct Wallets {
    wallets: BTreeMap<String, Wallet>,
}

impl Wallets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the wallet file, or start empty if it does not exist yet
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let file: WalletFile = serde_json::from_str(&json)?;

        let mut wallets = BTreeMap::new();
        for (address, secret_hex) in file.keys {
            let bytes = hex::decode(&secret_hex)
                .map_err(|e| Error::Wallet(format!("bad key for {}: {}", address, e)))?;
            let wallet = Wallet::from_secret_bytes(&bytes)?;

            if wallet.address() != address {
                return Err(Error::Wallet(format!(
                    "key stored under {} belongs to {}",
                    address,
                    wallet.address()
                )));
            }
            wallets.insert(address, wallet);
        }

        Ok(Self { wallets })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = WalletFile {
            keys: self
                .wallets
                .iter()
                .map(|(address, wallet)| {
                    (address.clone(), hex::encode(wallet.secret_key.secret_bytes()))
                })
                .collect(),
        };

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Generate a wallet and return its address
    pub fn create_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    pub fn get(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}
