// CLI commands

use crate::config::NodeConfig;
use crate::core::{Transaction, pub_key_hash_from_address, validate_address};
use crate::error::{Error, Result};
use crate::network::{Node, send_transaction};
use crate::storage::Storage;
use crate::wallet::{Wallets, new_transfer};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "utxo-node")]
#[command(about = "Minimal UTXO cryptocurrency node", long_about = None)]
pub struct Cli {
    /// JSON config file (defaults to NODE_ID and friends from the environment)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new key pair and store it in the wallet file
    #[command(name = "createwallet")]
    CreateWallet,

    /// List the addresses in the wallet file
    #[command(name = "listaddresses")]
    ListAddresses,

    /// Create a ledger whose genesis reward goes to ADDRESS
    #[command(name = "createblockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Get the balance of ADDRESS
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Send AMOUNT from FROM to TO
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Mine the transaction locally instead of handing it to the bootstrap node
        #[arg(long)]
        mine: bool,
    },

    /// Print every block, tip first
    #[command(name = "printchain")]
    PrintChain,

    /// Rebuild the UTXO index from the ledger
    #[command(name = "reindexutxo")]
    ReindexUtxo,

    /// Start a node, mining to MINER when given
    #[command(name = "startnode")]
    StartNode {
        #[arg(long)]
        miner: Option<String>,
    },

    /// Fetch the ledger from the bootstrap node and exit
    Sync,
}

/// CLI handler
pub struct CliHandler {
    config: NodeConfig,
}

impl CliHandler {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub async fn handle(&self, command: Commands) -> Result<()> {
        match command {
            Commands::CreateWallet => self.create_wallet(),
            Commands::ListAddresses => self.list_addresses(),
            Commands::CreateBlockchain { address } => self.create_blockchain(&address),
            Commands::GetBalance { address } => self.get_balance(&address),
            Commands::Send {
                from,
                to,
                amount,
                mine,
            } => self.send(&from, &to, amount, mine).await,
            Commands::PrintChain => self.print_chain(),
            Commands::ReindexUtxo => self.reindex_utxo(),
            Commands::StartNode { miner } => self.start_node(miner).await,
            Commands::Sync => self.sync().await,
        }
    }

    fn open_storage(&self) -> Result<Storage> {
        log::debug!("Opening ledger at {}", self.config.db_path().display());
        Storage::open(self.config.db_path())
    }

    fn create_wallet(&self) -> Result<()> {
        let path = self.config.wallet_path();
        let mut wallets = Wallets::load_or_default(&path)?;
        let address = wallets.create_wallet();
        wallets.save(&path)?;

        println!("Your new address: {}", address);
        Ok(())
    }

    fn list_addresses(&self) -> Result<()> {
        let wallets = Wallets::load_or_default(self.config.wallet_path())?;
        for address in wallets.addresses() {
            println!("{}", address);
        }
        Ok(())
    }

    fn create_blockchain(&self, address: &str) -> Result<()> {
        if !validate_address(address) {
            return Err(Error::InvalidAddress(address.to_string()));
        }

        let mut storage = self.open_storage()?;
        let genesis = storage.create_blockchain(address)?;
        storage.flush()?;

        println!("Genesis block: {}", genesis.hash);
        println!("Done!");
        Ok(())
    }

    fn get_balance(&self, address: &str) -> Result<()> {
        let pub_key_hash = pub_key_hash_from_address(address)?;
        let storage = self.open_storage()?;
        let balance = storage.utxo_set.balance(&pub_key_hash)?;

        println!("Balance of '{}': {}", address, balance);
        Ok(())
    }

    async fn send(&self, from: &str, to: &str, amount: u64, mine: bool) -> Result<()> {
        for address in [from, to] {
            if !validate_address(address) {
                return Err(Error::InvalidAddress(address.to_string()));
            }
        }

        let wallets = Wallets::load_or_default(self.config.wallet_path())?;
        let wallet = wallets
            .get(from)
            .ok_or_else(|| Error::Wallet(format!("no key for {} in this node's wallet", from)))?;

        let mut storage = self.open_storage()?;
        let tx = new_transfer(wallet, to, amount, &storage.utxo_set, &storage.blockchain)?;
        println!("Transaction {} (amount {}, fee {})", tx.id, tx.amount, tx.fee);

        if mine {
            let coinbase = Transaction::new_coinbase(from, "", Some(tx.fee))?;
            let block = storage.mine_block(vec![coinbase, tx])?;
            storage.flush()?;
            println!("Mined block {} at height {}", block.hash, block.height);
        } else {
            drop(storage);
            send_transaction(&self.config, tx).await?;
            println!("Sent to {}", self.config.bootstrap_addr);
        }

        println!("Success!");
        Ok(())
    }

    fn print_chain(&self) -> Result<()> {
        let storage = self.open_storage()?;
        for block in storage.blockchain.iter() {
            let block = block?;
            println!("{}", block);
            println!("PoW: {}", block.has_valid_pow()?);
            println!();
        }
        Ok(())
    }

    fn reindex_utxo(&self) -> Result<()> {
        let storage = self.open_storage()?;
        let count = storage.reindex_utxo()?;

        println!("Done! There are {} transactions in the UTXO set.", count);
        Ok(())
    }

    async fn start_node(&self, miner: Option<String>) -> Result<()> {
        let mut config = self.config.clone();
        if miner.is_some() {
            config.miner_address = miner;
        }
        config.validate()?;

        match &config.miner_address {
            Some(address) => println!("Mining is on. Reward address: {}", address),
            None => println!("Mining is off"),
        }
        println!("Starting node {}", config.node_id);

        let storage = self.open_storage()?;
        Node::new(config, storage).run().await
    }

    async fn sync(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.node_addr).await?;
        let node = Node::new(self.config.clone(), self.open_storage()?);
        node.sync(listener).await?;

        let storage = node.storage();
        let height = storage.read().await.blockchain.best_height()?;
        match height {
            Some(height) => println!("Ledger synced to height {}", height),
            None => println!("Ledger is still empty"),
        }
        Ok(())
    }
}
