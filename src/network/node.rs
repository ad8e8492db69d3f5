// Network node - peer protocol, mempool and mining

use crate::config::NodeConfig;
use crate::core::{Block, Hash256, Transaction};
use crate::error::{Error, Result};
use crate::network::{
    AddrFromPayload, AddrPayload, BlockPayload, BlockchainPayload, Command, DelTxPoolPayload,
    GetDataPayload, InvKind, InvPayload, Message, NODE_VERSION, TxPayload, VersionPayload,
    read_message, send_message,
};
use crate::storage::{AddBlockOutcome, Storage};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};

/// Network node.
///
/// Cheap to clone: every clone shares the same ledger, mempool and peer
/// set, so each connection task gets its own handle.
#[derive(Clone)]
pub struct Node {
    config: Arc<NodeConfig>,
    storage: Arc<RwLock<Storage>>,
    mempool: Arc<Mutex<HashMap<Hash256, Transaction>>>,
    known_nodes: Arc<RwLock<BTreeSet<String>>>,
    blocks_in_transit: Arc<Mutex<VecDeque<Hash256>>>,
    /// Set when a received block could not be applied incrementally
    needs_reindex: Arc<AtomicBool>,
    /// Only the ledger snapshot is accepted while set
    syncing: Arc<AtomicBool>,
    bootstrap_done: Arc<Notify>,
    /// Aborts the PoW search of the current mining attempt
    mining_cancel: Arc<AtomicBool>,
    mining_jobs: mpsc::Sender<()>,
    mining_queue: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl Node {
    pub fn new(config: NodeConfig, storage: Storage) -> Self {
        // One slot: a queued job already covers every later transaction
        let (mining_jobs, mining_queue) = mpsc::channel(1);
        let known_nodes = BTreeSet::from([config.bootstrap_addr.clone()]);

        Self {
            config: Arc::new(config),
            storage: Arc::new(RwLock::new(storage)),
            mempool: Arc::new(Mutex::new(HashMap::new())),
            known_nodes: Arc::new(RwLock::new(known_nodes)),
            blocks_in_transit: Arc::new(Mutex::new(VecDeque::new())),
            needs_reindex: Arc::new(AtomicBool::new(false)),
            syncing: Arc::new(AtomicBool::new(false)),
            bootstrap_done: Arc::new(Notify::new()),
            mining_cancel: Arc::new(AtomicBool::new(false)),
            mining_jobs,
            mining_queue: Arc::new(Mutex::new(Some(mining_queue))),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address announced to peers
    pub fn addr(&self) -> String {
        self.config.node_addr.clone()
    }

    pub fn storage(&self) -> Arc<RwLock<Storage>> {
        Arc::clone(&self.storage)
    }

    pub async fn known_nodes(&self) -> Vec<String> {
        self.known_nodes.read().await.iter().cloned().collect()
    }

    pub async fn mempool_len(&self) -> usize {
        self.mempool.lock().await.len()
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.node_addr).await?;
        self.serve(listener).await
    }

    /// Sync with the bootstrap node if needed, announce ourselves and
    /// handle inbound connections on `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!("Node listening on {}", self.config.node_addr);

        if self.config.is_miner() {
            if let Some(jobs) = self.mining_queue.lock().await.take() {
                tokio::spawn(self.clone().mining_loop(jobs));
            }
        }

        let acceptor = tokio::spawn(self.clone().accept_loop(listener));
        self.bootstrap().await?;

        if !self.config.is_bootstrap_node() {
            self.send_version(&self.config.bootstrap_addr).await?;
        }

        acceptor.await?
    }

    /// Fetch the ledger snapshot and stop
    pub async fn sync(&self, listener: TcpListener) -> Result<()> {
        let acceptor = tokio::spawn(self.clone().accept_loop(listener));
        let result = self.bootstrap().await;
        acceptor.abort();
        result
    }

    async fn accept_loop(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New connection from {}", addr);

            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(stream).await {
                    log::error!("Connection from {} failed: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let message = read_message(&mut stream, self.config.max_message_size).await?;
        self.handle_message(message).await
    }

    /// An empty non-bootstrap node asks for the whole ledger and waits for
    /// it, up to the bootstrap timeout
    async fn bootstrap(&self) -> Result<()> {
        if self.config.is_bootstrap_node() || !self.storage.read().await.blockchain.is_empty() {
            return Ok(());
        }

        let central = self.config.bootstrap_addr.clone();
        log::info!("Requesting ledger snapshot from {}", central);
        self.syncing.store(true, Ordering::SeqCst);

        let request = Message::GetBlockchain(AddrFromPayload { addr_from: self.addr() });
        if self.send(&central, &request).await {
            let wait = self.bootstrap_done.notified();
            match tokio::time::timeout(self.config.bootstrap_timeout(), wait).await {
                Ok(()) => log::info!("Ledger snapshot received"),
                Err(_) => log::warn!("{}; running with an empty ledger", Error::BootstrapTimeout(central)),
            }
        } else {
            log::warn!("Bootstrap node {} is down; running with an empty ledger", central);
        }

        self.syncing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Deliver `message` to `addr`. An unreachable peer is forgotten and
    /// `false` returned; callers carry on either way.
    async fn send(&self, addr: &str, message: &Message) -> bool {
        match send_message(addr, message, self.config.send_timeout()).await {
            Ok(()) => true,
            Err(e @ Error::PeerUnreachable { .. }) => {
                let mut known = self.known_nodes.write().await;
                known.remove(addr);
                log::warn!("{}; {} known nodes remain", e, known.len());
                false
            }
            Err(e) => {
                log::error!("Failed to send {} to {}: {}", message.command(), addr, e);
                false
            }
        }
    }

    async fn send_version(&self, addr: &str) -> Result<()> {
        let (best_height, last_hash) = {
            let storage = self.storage.read().await;
            (storage.blockchain.best_height()?, storage.blockchain.tip_hash())
        };

        let version = Message::Version(VersionPayload {
            version: NODE_VERSION,
            best_height,
            addr_from: self.addr(),
            last_hash,
        });
        self.send(addr, &version).await;
        Ok(())
    }

    async fn add_known_node(&self, addr: &str) {
        if !addr.is_empty() {
            self.known_nodes.write().await.insert(addr.to_string());
        }
    }

    async fn evict(&self, ids: impl IntoIterator<Item = Hash256>) {
        let mut mempool = self.mempool.lock().await;
        for id in ids {
            mempool.remove(&id);
        }
    }

    /// Dispatch one inbound message
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        log::debug!("Received {} from {}", message.command(), message.addr_from());

        if self.syncing.load(Ordering::SeqCst) && message.command() != Command::RecvBlockchain {
            log::debug!("Ignoring {} while waiting for the ledger snapshot", message.command());
            return Ok(());
        }

        match message {
            Message::Version(payload) => self.handle_version(payload).await,
            Message::Addr(payload) => {
                self.handle_addr(payload).await;
                Ok(())
            }
            Message::GetAddr(payload) => {
                self.handle_get_addr(payload).await;
                Ok(())
            }
            Message::Inv(payload) => self.handle_inv(payload).await,
            Message::GetData(payload) => self.handle_get_data(payload).await,
            Message::Block(payload) => self.handle_block(payload).await,
            Message::Tx(payload) => self.handle_tx(payload).await,
            Message::GetBlocks(payload) => self.handle_get_blocks(payload).await,
            Message::GetBlockchain(payload) => self.handle_get_blockchain(payload).await,
            Message::RecvBlockchain(payload) => self.handle_recv_blockchain(payload).await,
            Message::DelTxPool(payload) => {
                self.evict(payload.ids).await;
                Ok(())
            }
        }
    }

    async fn handle_version(&self, payload: VersionPayload) -> Result<()> {
        self.add_known_node(&payload.addr_from).await;

        let my_height = self.storage.read().await.blockchain.best_height()?;
        log::info!(
            "Version from {}: my height {:?}, theirs {:?}",
            payload.addr_from,
            my_height,
            payload.best_height
        );

        if my_height < payload.best_height {
            let request = Message::GetBlocks(AddrFromPayload { addr_from: self.addr() });
            self.send(&payload.addr_from, &request).await;
        } else if my_height > payload.best_height {
            self.send_version(&payload.addr_from).await?;
        }
        Ok(())
    }

    async fn handle_addr(&self, payload: AddrPayload) {
        let mut known = self.known_nodes.write().await;
        known.extend(payload.addr_list.into_iter().filter(|a| !a.is_empty()));
        log::info!("There are {} known nodes now", known.len());
    }

    async fn handle_get_addr(&self, payload: AddrFromPayload) {
        self.add_known_node(&payload.addr_from).await;

        let mut nodes = self.known_nodes.read().await.clone();
        nodes.insert(self.addr());
        let addr_list = nodes.into_iter().collect();

        let reply = Message::Addr(AddrPayload {
            addr_from: self.addr(),
            addr_list,
        });
        self.send(&payload.addr_from, &reply).await;
    }

    async fn handle_inv(&self, payload: InvPayload) -> Result<()> {
        log::info!(
            "Received inventory with {} {:?} items from {}",
            payload.items.len(),
            payload.kind,
            payload.addr_from
        );

        match payload.kind {
            InvKind::Block => {
                let mut missing = VecDeque::new();
                {
                    let storage = self.storage.read().await;
                    for hash in payload.items {
                        if !storage.blockchain.has_block(&hash)? {
                            missing.push_back(hash);
                        }
                    }
                }

                let Some(first) = missing.pop_front() else {
                    return Ok(());
                };
                *self.blocks_in_transit.lock().await = missing;

                let request = Message::GetData(GetDataPayload {
                    addr_from: self.addr(),
                    kind: InvKind::Block,
                    id: first,
                });
                self.send(&payload.addr_from, &request).await;
            }
            InvKind::Tx => {
                let wanted: Vec<Hash256> = {
                    let mempool = self.mempool.lock().await;
                    payload
                        .items
                        .into_iter()
                        .filter(|id| !mempool.contains_key(id))
                        .collect()
                };

                for id in wanted {
                    let request = Message::GetData(GetDataPayload {
                        addr_from: self.addr(),
                        kind: InvKind::Tx,
                        id,
                    });
                    self.send(&payload.addr_from, &request).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_get_data(&self, payload: GetDataPayload) -> Result<()> {
        let reply = match payload.kind {
            InvKind::Block => match self.storage.read().await.blockchain.get_block(&payload.id) {
                Ok(block) => Message::Block(BlockPayload {
                    addr_from: self.addr(),
                    block,
                }),
                Err(Error::BlockNotFound(_)) => {
                    log::debug!("Requested block {} is unknown", payload.id);
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            InvKind::Tx => match self.mempool.lock().await.get(&payload.id).cloned() {
                Some(transaction) => Message::Tx(TxPayload {
                    addr_from: self.addr(),
                    transaction,
                }),
                None => {
                    log::debug!("Requested transaction {} is not pending", payload.id);
                    return Ok(());
                }
            },
        };

        self.send(&payload.addr_from, &reply).await;
        Ok(())
    }

    async fn handle_block(&self, payload: BlockPayload) -> Result<()> {
        let block = payload.block;

        let added = {
            let mut storage = self.storage.write().await;
            let previous_tip = storage.blockchain.tip_hash();
            let added = storage.blockchain.add_block(&block);

            if let Ok(AddBlockOutcome::NewTip) = added {
                let extends_tip = previous_tip.unwrap_or_default() == block.prev_hash;
                if extends_tip && !self.needs_reindex.load(Ordering::SeqCst) {
                    if let Err(e) = storage.utxo_set.update(&block) {
                        log::warn!("Incremental UTXO update failed, scheduling reindex: {}", e);
                        self.needs_reindex.store(true, Ordering::SeqCst);
                    }
                } else {
                    self.needs_reindex.store(true, Ordering::SeqCst);
                }
            }
            added
        };

        // A rejected block must not stall the rest of the download
        match added {
            Ok(outcome) => {
                if outcome == AddBlockOutcome::NewTip {
                    self.mining_cancel.store(true, Ordering::SeqCst);
                }
                self.evict(block.transactions.iter().map(|tx| tx.id)).await;
            }
            Err(ref e) => {
                log::warn!("Rejected block {} from {}: {}", block.hash, payload.addr_from, e);
            }
        }

        let next = self.blocks_in_transit.lock().await.pop_front();
        match next {
            Some(id) => {
                let request = Message::GetData(GetDataPayload {
                    addr_from: self.addr(),
                    kind: InvKind::Block,
                    id,
                });
                self.send(&payload.addr_from, &request).await;
            }
            None => {
                if self.needs_reindex.swap(false, Ordering::SeqCst) {
                    let count = self.storage.write().await.reindex_utxo()?;
                    log::info!("UTXO index rebuilt with {} transactions", count);
                }
            }
        }

        added.map(|_| ())
    }

    async fn handle_tx(&self, payload: TxPayload) -> Result<()> {
        let tx = payload.transaction;
        if tx.hash()? != tx.id {
            return Err(Error::InvalidTransaction {
                id: tx.id,
                reason: "id does not match contents".to_owned(),
            });
        }

        let id = tx.id;
        let pending = {
            let mut mempool = self.mempool.lock().await;
            mempool.insert(id, tx);
            mempool.len()
        };
        log::info!("Transaction {} added to mempool ({} pending)", id, pending);

        if self.config.is_bootstrap_node() {
            let me = self.addr();
            let peers: Vec<String> = self
                .known_nodes
                .read()
                .await
                .iter()
                .filter(|node| **node != me && **node != payload.addr_from)
                .cloned()
                .collect();

            let inv = Message::Inv(InvPayload {
                addr_from: me,
                kind: InvKind::Tx,
                items: vec![id],
            });
            for peer in peers {
                self.send(&peer, &inv).await;
            }
        }

        if self.config.is_miner() && pending >= self.config.mine_tx_count {
            self.request_mining();
        }
        Ok(())
    }

    async fn handle_get_blocks(&self, payload: AddrFromPayload) -> Result<()> {
        let items = self.storage.read().await.blockchain.block_hashes()?;
        let reply = Message::Inv(InvPayload {
            addr_from: self.addr(),
            kind: InvKind::Block,
            items,
        });
        self.send(&payload.addr_from, &reply).await;
        Ok(())
    }

    async fn handle_get_blockchain(&self, payload: AddrFromPayload) -> Result<()> {
        let blocks = self.storage.read().await.blockchain.blocks_from_genesis()?;
        log::info!("Sending {} blocks to {}", blocks.len(), payload.addr_from);

        let reply = Message::RecvBlockchain(BlockchainPayload {
            addr_from: self.addr(),
            blocks,
        });
        self.send(&payload.addr_from, &reply).await;
        Ok(())
    }

    async fn handle_recv_blockchain(&self, payload: BlockchainPayload) -> Result<()> {
        let mut imported = 0;
        {
            let mut storage = self.storage.write().await;
            for block in &payload.blocks {
                if storage.blockchain.add_block(block)? != AddBlockOutcome::Duplicate {
                    imported += 1;
                }
            }
            storage.reindex_utxo()?;
            storage.flush()?;
        }
        self.needs_reindex.store(false, Ordering::SeqCst);
        log::info!("Imported {} blocks from {}", imported, payload.addr_from);

        self.add_known_node(&payload.addr_from).await;
        self.bootstrap_done.notify_one();
        Ok(())
    }

    fn request_mining(&self) {
        // A full queue already holds a job that will pick this transaction up
        if self.mining_jobs.try_send(()).is_ok() {
            log::debug!("Mining job queued");
        }
    }

    async fn mining_loop(self, mut jobs: mpsc::Receiver<()>) {
        while jobs.recv().await.is_some() {
            if let Err(e) = self.mine_pending().await {
                log::error!("Mining failed: {}", e);
            }
        }
    }

    /// Mine blocks from the mempool until fewer than `mine_tx_count`
    /// transactions are pending
    async fn mine_pending(&self) -> Result<()> {
        let Some(miner) = self.config.miner_address.clone() else {
            return Ok(());
        };

        while self.mempool_len().await >= self.config.mine_tx_count {
            self.mining_cancel.store(false, Ordering::SeqCst);

            let (transactions, prev_hash, height) = {
                let storage = self.storage.read().await;
                let batch = self.select_transactions(&storage).await?;
                if batch.is_empty() {
                    log::info!("No minable transactions in the mempool");
                    return Ok(());
                }

                let fees = batch.iter().fold(0u64, |sum, tx| sum.saturating_add(tx.fee));
                let coinbase = Transaction::new_coinbase(&miner, "", Some(fees))?;
                let (prev_hash, height) = storage.blockchain.next_block_position()?;

                let mut transactions = Vec::with_capacity(batch.len() + 1);
                transactions.push(coinbase);
                transactions.extend(batch);
                (transactions, prev_hash, height)
            };

            let cancel = Arc::clone(&self.mining_cancel);
            let mined =
                tokio::task::spawn_blocking(move || Block::mine(transactions, prev_hash, height, &cancel))
                    .await?;
            let block = match mined {
                Ok(block) => block,
                Err(Error::MiningCancelled) => {
                    log::info!("Tip moved while mining, starting over");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.storage.write().await.commit_mined(&block) {
                Ok(()) => {}
                Err(e @ Error::StaleBlock { .. }) => {
                    log::info!("{}; starting over", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            log::info!(
                "New block {} mined at height {} with {} transactions",
                block.hash,
                block.height,
                block.transactions.len()
            );

            let ids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.id).collect();
            self.evict(ids.iter().copied()).await;
            self.announce_block(&block, ids).await;
        }
        Ok(())
    }

    /// Pick the pending transactions that can go into the next block.
    ///
    /// Transactions that can never be mined are dropped from the mempool.
    /// Ones whose parent is not on chain yet, or that conflict with an
    /// earlier pick, stay pending.
    async fn select_transactions(&self, storage: &Storage) -> Result<Vec<Transaction>> {
        let mut mempool = self.mempool.lock().await;
        let mut pending: Vec<&Transaction> = mempool.values().collect();
        pending.sort_by_key(|tx| (tx.timestamp, tx.id));

        let mut batch = Vec::new();
        let mut rejected = Vec::new();
        let mut claimed = HashSet::new();

        'pending: for tx in pending {
            if tx.is_coinbase() {
                rejected.push((tx.id, "coinbase outside a block".to_owned()));
                continue;
            }

            match storage.blockchain.validate_transaction(tx) {
                Ok(()) => {}
                Err(Error::InvalidSignature(_)) => {
                    rejected.push((tx.id, "invalid signature".to_owned()));
                    continue;
                }
                Err(Error::TransactionNotFound(_)) => continue,
                Err(Error::InvalidTransaction { reason, .. }) => {
                    rejected.push((tx.id, reason));
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut outpoints = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                let Ok(index) = u32::try_from(input.output_index) else {
                    rejected.push((tx.id, "negative output index".to_owned()));
                    continue 'pending;
                };
                let outpoint = (input.txid, index);
                if outpoints.contains(&outpoint) {
                    rejected.push((tx.id, "spends an output twice".to_owned()));
                    continue 'pending;
                }
                if !storage.utxo_set.is_unspent(&input.txid, index)? {
                    rejected.push((tx.id, format!("output {}:{} is already spent", input.txid, index)));
                    continue 'pending;
                }
                outpoints.push(outpoint);
            }

            if outpoints.iter().any(|outpoint| claimed.contains(outpoint)) {
                continue;
            }
            claimed.extend(outpoints);
            batch.push(tx.clone());
        }

        for (id, reason) in rejected {
            mempool.remove(&id);
            log::warn!("Dropped transaction {} from mempool: {}", id, reason);
        }
        Ok(batch)
    }

    async fn announce_block(&self, block: &Block, ids: Vec<Hash256>) {
        let me = self.addr();
        let peers: Vec<String> = self
            .known_nodes
            .read()
            .await
            .iter()
            .filter(|node| **node != me)
            .cloned()
            .collect();

        let inv = Message::Inv(InvPayload {
            addr_from: me.clone(),
            kind: InvKind::Block,
            items: vec![block.hash],
        });
        let del = Message::DelTxPool(DelTxPoolPayload { addr_from: me, ids });

        for peer in peers {
            if self.send(&peer, &inv).await {
                self.send(&peer, &del).await;
            }
        }
    }
}

/// Hand a transaction to the bootstrap node for relay and mining
pub async fn send_transaction(config: &NodeConfig, transaction: Transaction) -> Result<()> {
    let message = Message::Tx(TxPayload {
        addr_from: config.node_addr.clone(),
        transaction,
    });
    send_message(&config.bootstrap_addr, &message, config.send_timeout()).await
}
