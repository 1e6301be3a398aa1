//! Fixtures shared by the unit tests.

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use chrono::{DateTime, Utc};

use crate::chain::{ChainBlock, MockChainClient};
use crate::ledger::store::LedgerStore;
use crate::ledger::types::{BlockBatch, TransactionRecord};

pub const ACCT1: &str = "tb1q2ye03p4jdcja4vn9ap4tfq0qcc6esw3zwthcau";
pub const ACCT2: &str = "tb1qr9d7z0es86sps5f2kefx5grpj4a5yvp4evj80z";
pub const OTHER1: &str = "tb1q2ye03p4jdcja4vn9ap4tfq0qcc6esw3zwthkau";
pub const OTHER2: &str = "tb1qr9d7z0es86sps5f2kefx5grpj4a5yvp4evj80y";

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Distinct hash per (height, fork); fork 0 is the canonical chain.
pub fn block_hash(height: u32, fork: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    bytes[4] = fork;
    bytes[31] = 0xB1;
    BlockHash::from_byte_array(bytes)
}

/// Block `height` on `fork`, whose parent is `height - 1` on `parent_fork`.
pub fn chain_block(height: u32, fork: u8, parent_fork: u8, transfers: &[(&str, &str, u64)]) -> ChainBlock {
    MockChainClient::build_block(
        height,
        block_hash(height, fork),
        block_hash(height.saturating_sub(1), parent_fork),
        ts("2020-05-07T14:00:00Z") + chrono::Duration::minutes(10 * height as i64),
        transfers,
    )
}

pub fn batch(block: ChainBlock) -> BlockBatch {
    block.into_batch().unwrap()
}

/// Stages `from..=to` on the canonical chain, seeding the first block.
pub async fn stage_range<S: LedgerStore + ?Sized>(store: &S, from: u32, to: u32) {
    store
        .admit_block_unchecked(&batch(chain_block(from, 0, 0, &[])))
        .await
        .unwrap();
    for h in from + 1..=to {
        store.admit_block(&batch(chain_block(h, 0, 0, &[]))).await.unwrap();
    }
}

pub fn history(block: u32, from: &str, to: &str, value: u64, time: &str, tx: u32) -> TransactionRecord {
    TransactionRecord {
        block,
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        value,
        time: ts(time),
        block_hash: block_hash(block, 0),
        tx_hash: crate::chain::mock::mock_txid(block, tx),
        parent_block_hash: None,
    }
}

/// Testnet P2WPKH address derived from `seed`, and its base64 segwit-header
/// signature over `message`.
pub fn sign_message(seed: u8, message: &str) -> (String, String) {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
    use bitcoin::sign_message::{signed_msg_hash, MessageSignature};

    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
    let public = PublicKey::from_secret_key(&secp, &secret);
    let address = bitcoin::Address::p2wpkh(&bitcoin::CompressedPublicKey(public), bitcoin::Network::Testnet);

    let digest = Message::from_digest(signed_msg_hash(message).to_byte_array());
    let mut bytes = MessageSignature::new(secp.sign_ecdsa_recoverable(&digest, &secret), true).serialize();
    bytes[0] += 8;

    (address.to_string(), STANDARD.encode(bytes))
}
