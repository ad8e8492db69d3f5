// Core ledger data structures

mod address;
mod block;
mod hash;
mod merkle;
mod serialize;
mod transaction;
mod types;

pub use address::*;
pub use block::*;
pub use hash::*;
pub use merkle::*;
pub use serialize::*;
pub use transaction::*;
pub use types::*;
