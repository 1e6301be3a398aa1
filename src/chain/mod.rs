//! Remote chain-data providers behind one trait.
//!
//! Provider-specific JSON never leaves this module: every client decodes into
//! [`normalize::RawTx`] and applies the shared normalisation rules.

mod api;
pub mod blockcypher;
pub mod esplora;
mod http;
pub mod mock;
pub mod normalize;


pub use api::{ChainBlock, ChainClient, ChainError};
pub use blockcypher::BlockCypherClient;
pub use esplora::EsploraClient;
pub use mock::MockChainClient;
