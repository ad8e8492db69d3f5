// Network protocol messages

use crate::core::{Block, Hash256, Transaction};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Width of the NUL-padded command name that prefixes every message
pub const COMMAND_LENGTH: usize = 12;

/// Protocol version announced in `version` messages
pub const NODE_VERSION: u32 = 1;

/// Message command names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Addr,
    GetAddr,
    Inv,
    GetData,
    Block,
    Tx,
    GetBlocks,
    GetBlockchain,
    RecvBlockchain,
    DelTxPool,
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::Version,
        Command::Addr,
        Command::GetAddr,
        Command::Inv,
        Command::GetData,
        Command::Block,
        Command::Tx,
        Command::GetBlocks,
        Command::GetBlockchain,
        Command::RecvBlockchain,
        Command::DelTxPool,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Addr => "addr",
            Command::GetAddr => "getaddr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::GetBlocks => "getblocks",
            Command::GetBlockchain => "getbc",
            Command::RecvBlockchain => "recv_bc",
            Command::DelTxPool => "del_tx_pool",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Command name padded with NUL bytes to `COMMAND_LENGTH`
    pub fn to_bytes(&self) -> [u8; COMMAND_LENGTH] {
        let mut bytes = [0u8; COMMAND_LENGTH];
        let name = self.name().as_bytes();
        bytes[..name.len()].copy_from_slice(name);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let name: Vec<u8> = bytes.iter().copied().take_while(|b| *b != 0).collect();
        let name = String::from_utf8_lossy(&name);
        Self::from_name(&name).ok_or_else(|| Error::UnknownCommand(name.into_owned()))
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inventory type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    /// `None` while the sender's ledger is empty
    pub best_height: Option<u64>,
    pub addr_from: String,
    pub last_hash: Option<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addr_from: String,
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub id: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Transaction,
}

/// Payload of requests that carry nothing but the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrFromPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainPayload {
    pub addr_from: String,
    /// Whole chain, genesis first
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelTxPoolPayload {
    pub addr_from: String,
    pub ids: Vec<Hash256>,
}

/// Network message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Addr(AddrPayload),
    GetAddr(AddrFromPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
    GetBlocks(AddrFromPayload),
    GetBlockchain(AddrFromPayload),
    RecvBlockchain(BlockchainPayload),
    DelTxPool(DelTxPoolPayload),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Addr(_) => Command::Addr,
            Message::GetAddr(_) => Command::GetAddr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::Block(_) => Command::Block,
            Message::Tx(_) => Command::Tx,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::GetBlockchain(_) => Command::GetBlockchain,
            Message::RecvBlockchain(_) => Command::RecvBlockchain,
            Message::DelTxPool(_) => Command::DelTxPool,
        }
    }

    /// Address of the node that sent this message
    pub fn addr_from(&self) -> &str {
        match self {
            Message::Version(p) => &p.addr_from,
            Message::Addr(p) => &p.addr_from,
            Message::Inv(p) => &p.addr_from,
            Message::GetData(p) => &p.addr_from,
            Message::Block(p) => &p.addr_from,
            Message::Tx(p) => &p.addr_from,
            Message::RecvBlockchain(p) => &p.addr_from,
            Message::DelTxPool(p) => &p.addr_from,
            Message::GetAddr(p) | Message::GetBlocks(p) | Message::GetBlockchain(p) => {
                &p.addr_from
            }
        }
    }

    /// Command header followed by the bincode payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Version(p) => bincode::serialize(p)?,
            Message::Addr(p) => bincode::serialize(p)?,
            Message::Inv(p) => bincode::serialize(p)?,
            Message::GetData(p) => bincode::serialize(p)?,
            Message::Block(p) => bincode::serialize(p)?,
            Message::Tx(p) => bincode::serialize(p)?,
            Message::RecvBlockchain(p) => bincode::serialize(p)?,
            Message::DelTxPool(p) => bincode::serialize(p)?,
            Message::GetAddr(p) | Message::GetBlocks(p) | Message::GetBlockchain(p) => {
                bincode::serialize(p)?
            }
        };

        let mut bytes = Vec::with_capacity(COMMAND_LENGTH + payload.len());
        bytes.extend_from_slice(&self.command().to_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < COMMAND_LENGTH {
            return Err(Error::UnknownCommand(hex::encode(data)));
        }

        let (header, body) = data.split_at(COMMAND_LENGTH);
        let message = match Command::from_bytes(header)? {
            Command::Version => Message::Version(payload(body)?),
            Command::Addr => Message::Addr(payload(body)?),
            Command::GetAddr => Message::GetAddr(payload(body)?),
            Command::Inv => Message::Inv(payload(body)?),
            Command::GetData => Message::GetData(payload(body)?),
            Command::Block => Message::Block(payload(body)?),
            Command::Tx => Message::Tx(payload(body)?),
            Command::GetBlocks => Message::GetBlocks(payload(body)?),
            Command::GetBlockchain => Message::GetBlockchain(payload(body)?),
            Command::RecvBlockchain => Message::RecvBlockchain(payload(body)?),
            Command::DelTxPool => Message::DelTxPool(payload(body)?),
        };
        Ok(message)
    }
}

fn payload<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}
