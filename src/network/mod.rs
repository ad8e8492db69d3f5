// Peer-to-peer protocol

mod message;
mod node;
mod peer;

pub use message::{
    AddrFromPayload, AddrPayload, BlockPayload, BlockchainPayload, COMMAND_LENGTH, Command,
    DelTxPoolPayload, GetDataPayload, InvKind, InvPayload, Message, NODE_VERSION, TxPayload,
    VersionPayload,
};
pub use node::{Node, send_transaction};
pub use peer::{read_message, send_message};
