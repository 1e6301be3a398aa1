//! Bitcoin signed-message verification.
//!
//! Signatures are the 65-byte compact recoverable form wallets produce for
//! "Sign Message", base64 encoded. Header bytes 27..=34 are the legacy
//! encoding; 35..=42 are the segwit variants (P2SH-P2WPKH, then P2WPKH),
//! which always carry a compressed key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bitcoin::address::NetworkUnchecked;
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use bitcoin::{Address, Network};

use crate::ledger::error::{LedgerError, Result};

const SIGNATURE_LEN: usize = 65;
const HEADER_MIN: u8 = 27;
const HEADER_MAX: u8 = 42;
const SEGWIT_HEADER_MIN: u8 = 35;

pub trait SignatureVerifier: Send + Sync {
    /// `true` iff `signature_b64` over `message` was produced by the key
    /// behind `address`. Malformed input is an error, not `false`.
    fn verify(&self, address: &str, signature_b64: &str, message: &str) -> Result<bool>;
}

pub struct BitcoinMessageVerifier {
    network: Network,
    secp: Secp256k1<VerifyOnly>,
}

impl BitcoinMessageVerifier {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::verification_only(),
        }
    }

    fn parse_address(&self, address: &str) -> Result<Address> {
        address
            .trim()
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| LedgerError::InvalidInput(format!("address {}: {}", address, e)))?
            .require_network(self.network)
            .map_err(|e| LedgerError::InvalidInput(format!("address {}: {}", address, e)))
    }
}

/// Decodes the base64 transport form into a [`MessageSignature`].
pub fn decode_signature(signature_b64: &str) -> Result<MessageSignature> {
    let bytes = STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| LedgerError::InvalidInput(format!("signature is not base64: {}", e)))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(LedgerError::InvalidInput(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LEN,
            bytes.len()
        )));
    }

    let header = bytes[0];
    if !(HEADER_MIN..=HEADER_MAX).contains(&header) {
        return Err(LedgerError::InvalidInput(format!(
            "unsupported signature header {}",
            header
        )));
    }

    let flags = header - HEADER_MIN;
    let compressed = header >= SEGWIT_HEADER_MIN || flags & 0x04 != 0;
    let recovery_id = RecoveryId::from_i32(i32::from(flags & 0x03))
        .map_err(|e| LedgerError::InvalidInput(format!("recovery id: {}", e)))?;
    let signature = RecoverableSignature::from_compact(&bytes[1..], recovery_id)
        .map_err(|e| LedgerError::InvalidInput(format!("signature: {}", e)))?;

    Ok(MessageSignature::new(signature, compressed))
}

impl SignatureVerifier for BitcoinMessageVerifier {
    fn verify(&self, address: &str, signature_b64: &str, message: &str) -> Result<bool> {
        let address = self.parse_address(address)?;
        let signature = decode_signature(signature_b64)?;

        let pubkey = match signature.recover_pubkey(&self.secp, signed_msg_hash(message)) {
            Ok(pubkey) => pubkey,
            Err(e) => {
                log::debug!("[SIGNATURE] key recovery failed for {}: {}", address, e);
                return Ok(false);
            }
        };

        let related = address.is_related_to_pubkey(&pubkey);
        log::trace!("[SIGNATURE] {} related to recovered key: {}", address, related);
        Ok(related)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Message, SecretKey};
    use bitcoin::{CompressedPublicKey, PublicKey};

    const MESSAGE: &str = "ledger access challenge 1715180000";

    struct Signer {
        secret: SecretKey,
        public: bitcoin::secp256k1::PublicKey,
    }

    impl Signer {
        fn new(seed: u8) -> Self {
            let secp = Secp256k1::new();
            let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
            let public = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &secret);
            Self { secret, public }
        }

        /// Base64 signature with `header_offset` added to the legacy
        /// compressed header (8 gives the P2WPKH variant).
        fn sign(&self, message: &str, header_offset: u8) -> String {
            let secp = Secp256k1::new();
            let digest = Message::from_digest(signed_msg_hash(message).to_byte_array());
            let sig = secp.sign_ecdsa_recoverable(&digest, &self.secret);
            let mut bytes = MessageSignature::new(sig, true).serialize();
            bytes[0] += header_offset;
            STANDARD.encode(bytes)
        }

        fn p2pkh(&self) -> String {
            Address::p2pkh(PublicKey::new(self.public).pubkey_hash(), Network::Testnet).to_string()
        }

        fn p2wpkh(&self) -> String {
            Address::p2wpkh(&CompressedPublicKey(self.public), Network::Testnet).to_string()
        }
    }

    fn verifier() -> BitcoinMessageVerifier {
        BitcoinMessageVerifier::new(Network::Testnet)
    }

    #[test]
    fn legacy_signature_over_p2pkh() {
        let signer = Signer::new(0x11);
        let sig = signer.sign(MESSAGE, 0);
        assert!(verifier().verify(&signer.p2pkh(), &sig, MESSAGE).unwrap());
    }

    #[test]
    fn segwit_header_over_p2wpkh() {
        let signer = Signer::new(0x22);
        let sig = signer.sign(MESSAGE, 8);
        assert!(verifier().verify(&signer.p2wpkh(), &sig, MESSAGE).unwrap());
        // legacy header is accepted for segwit addresses too
        let legacy = signer.sign(MESSAGE, 0);
        assert!(verifier().verify(&signer.p2wpkh(), &legacy, MESSAGE).unwrap());
    }

    #[test]
    fn other_message_or_other_key_is_false() {
        let signer = Signer::new(0x33);
        let other = Signer::new(0x44);
        let sig = signer.sign(MESSAGE, 0);

        assert!(!verifier().verify(&signer.p2pkh(), &sig, "something else").unwrap());
        assert!(!verifier().verify(&other.p2pkh(), &sig, MESSAGE).unwrap());
    }

    #[test]
    fn malformed_inputs_are_errors() {
        let signer = Signer::new(0x55);
        let sig = signer.sign(MESSAGE, 0);

        let not_base64 = verifier().verify(&signer.p2pkh(), "%%%", MESSAGE);
        assert!(matches!(not_base64, Err(LedgerError::InvalidInput(_))));

        let short = verifier().verify(&signer.p2pkh(), &STANDARD.encode([31u8; 10]), MESSAGE);
        assert!(matches!(short, Err(LedgerError::InvalidInput(_))));

        let mut bytes = STANDARD.decode(&sig).unwrap();
        bytes[0] = 50;
        let header = verifier().verify(&signer.p2pkh(), &STANDARD.encode(bytes), MESSAGE);
        assert!(matches!(header, Err(LedgerError::InvalidInput(_))));

        let address = verifier().verify("not-an-address", &sig, MESSAGE);
        assert!(matches!(address, Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn wrong_network_is_an_error() {
        let signer = Signer::new(0x66);
        let sig = signer.sign(MESSAGE, 0);
        let mainnet = BitcoinMessageVerifier::new(Network::Bitcoin);

        let result = mainnet.verify(&signer.p2pkh(), &sig, MESSAGE);
        assert!(matches!(result, Err(LedgerError::InvalidInput(_))));
    }
}
