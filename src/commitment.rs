//! Commitment verifier (spec §4.2): authorization at registration time, and spend-proof before
//! the first notification.

use crate::chain_client::ChainClient;
use crate::networks::NetworkId;
use crate::store::Store;
use bitcoin::{consensus::encode, Transaction, Txid};
use rusqlite::Connection;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CommitmentError {
    #[error("commitment hex could not be decoded as a transaction: {0}")]
    Malformed(String),
    #[error("commitment '{0}' is already bound to a different vault")]
    Reused(Txid),
    #[error("the authorized-addresses database is unavailable")]
    AuthorizationUnavailable,
    #[error("commitment '{0}' does not pay any authorized address")]
    Unauthorized(Txid),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Decodes `tx_hex`, checks it isn't already bound to a different vault, and checks that at
/// least one of its outputs pays an address present in the operator-managed authorized-addresses
/// database. Returns the commitment's txid on success (spec §4.2 "Authorization").
pub fn authorize(
    tx_hex: &str,
    network: NetworkId,
    db_folder: &Path,
    declared_vault_id: &str,
    store: &Store,
) -> Result<Txid, CommitmentError> {
    let raw = hex_decode(tx_hex).map_err(CommitmentError::Malformed)?;
    let tx: Transaction =
        encode::deserialize(&raw).map_err(|e| CommitmentError::Malformed(e.to_string()))?;
    let txid = tx.compute_txid();

    if let Some(existing_vault) = store.commitment_vault_id(txid)? {
        return if existing_vault == declared_vault_id {
            Ok(txid)
        } else {
            Err(CommitmentError::Reused(txid))
        };
    }

    let addresses_path = db_folder.join(network.addresses_filename());
    let addresses_conn = Connection::open_with_flags(
        &addresses_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|_| CommitmentError::AuthorizationUnavailable)?;

    let bitcoin_network = network.bitcoin_network();
    for output in &tx.output {
        let Ok(address) = bitcoin::Address::from_script(&output.script_pubkey, bitcoin_network)
        else {
            continue;
        };
        let found: Result<i64, rusqlite::Error> = addresses_conn.query_row(
            "SELECT 1 FROM addresses WHERE address = ?1",
            [address.to_string()],
            |row| row.get(0),
        );
        match found {
            Ok(_) => return Ok(txid),
            Err(rusqlite::Error::QueryReturnedNoRows) => continue,
            Err(_) => return Err(CommitmentError::AuthorizationUnavailable),
        }
    }

    Err(CommitmentError::Unauthorized(txid))
}

/// Fetches the trigger's details from the chain client and returns true iff one of its inputs
/// spends `commitment_txid` (spec §4.2 "Spend-proof"). Any chain-client error is treated as "not
/// yet provable"; the caller retries on a later cycle.
pub fn verify_spend(trigger_txid: Txid, commitment_txid: Txid, chain: &ChainClient) -> bool {
    match chain.tx_details(trigger_txid) {
        Ok(Some(details)) => details.vin.iter().any(|input| *input == commitment_txid),
        Ok(None) | Err(_) => false,
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, TxOut};

    fn sample_tx(value: u64, script: ScriptBuf) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script,
            }],
        }
    }

    #[test]
    fn reuse_under_different_vault_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let addr =
            bitcoin::Address::p2wpkh(&sample_pubkey(), bitcoin::Network::Bitcoin);
        let tx = sample_tx(10_000, addr.script_pubkey());
        let hex = encode::serialize_hex(&tx);
        let txid = tx.compute_txid();

        // Pre-register the commitment under a different vault directly through the store's
        // internals by registering a vault with this commitment txid.
        let mut store_mut = store;
        let reg = crate::store::VaultRegistration {
            push_token: "t".into(),
            wallet_id: "w".into(),
            wallet_name: "W".into(),
            watchtower_id: "wt".into(),
            locale: None,
            vault_id: "other-vault".into(),
            vault_number: 0,
            trigger_txids: vec![],
            commitment_txid: Some(txid),
        };
        store_mut.register_vault(&reg).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = authorize(&hex, NetworkId::Bitcoin, dir.path(), "my-vault", &store_mut)
            .unwrap_err();
        assert!(matches!(err, CommitmentError::Reused(_)));
    }

    #[test]
    fn missing_addresses_db_is_unavailable() {
        let store = Store::open_in_memory().unwrap();
        let addr =
            bitcoin::Address::p2wpkh(&sample_pubkey(), bitcoin::Network::Bitcoin);
        let tx = sample_tx(10_000, addr.script_pubkey());
        let hex = encode::serialize_hex(&tx);

        let dir = tempfile::tempdir().unwrap();
        let err = authorize(&hex, NetworkId::Bitcoin, dir.path(), "my-vault", &store).unwrap_err();
        assert!(matches!(err, CommitmentError::AuthorizationUnavailable));
    }

    #[test]
    fn unauthorized_output_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let addr =
            bitcoin::Address::p2wpkh(&sample_pubkey(), bitcoin::Network::Bitcoin);
        let tx = sample_tx(10_000, addr.script_pubkey());
        let hex = encode::serialize_hex(&tx);

        let dir = tempfile::tempdir().unwrap();
        let addresses_path = dir.path().join(NetworkId::Bitcoin.addresses_filename());
        let conn = Connection::open(addresses_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE addresses (address TEXT PRIMARY KEY, created_at INTEGER NOT NULL);",
        )
        .unwrap();

        let err = authorize(&hex, NetworkId::Bitcoin, dir.path(), "my-vault", &store).unwrap_err();
        assert!(matches!(err, CommitmentError::Unauthorized(_)));
    }

    #[test]
    fn authorized_output_succeeds() {
        let store = Store::open_in_memory().unwrap();
        let addr =
            bitcoin::Address::p2wpkh(&sample_pubkey(), bitcoin::Network::Bitcoin);
        let tx = sample_tx(10_000, addr.script_pubkey());
        let hex = encode::serialize_hex(&tx);
        let txid = tx.compute_txid();

        let dir = tempfile::tempdir().unwrap();
        let addresses_path = dir.path().join(NetworkId::Bitcoin.addresses_filename());
        let conn = Connection::open(addresses_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE addresses (address TEXT PRIMARY KEY, created_at INTEGER NOT NULL);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO addresses (address, created_at) VALUES (?1, 0)",
            [addr.to_string()],
        )
        .unwrap();

        let got = authorize(&hex, NetworkId::Bitcoin, dir.path(), "my-vault", &store).unwrap();
        assert_eq!(got, txid);
    }

    fn sample_pubkey() -> bitcoin::CompressedPublicKey {
        use bitcoin::secp256k1::{Secp256k1, SecretKey};
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let pk = bitcoin::PublicKey::new(sk.public_key(&secp));
        bitcoin::CompressedPublicKey::try_from(pk).unwrap()
    }
}
