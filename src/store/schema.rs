//! SQLite schema bootstrap, prepared once per `Store::open` (spec §3, §6.4).

use rusqlite::Connection;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vault_txids (
    txid TEXT PRIMARY KEY,
    vaultId TEXT NOT NULL,
    status TEXT NOT NULL,
    commitmentTxid TEXT
);

CREATE INDEX IF NOT EXISTS vault_txids_vault_idx ON vault_txids(vaultId);
CREATE INDEX IF NOT EXISTS vault_txids_status_idx ON vault_txids(status);

CREATE TABLE IF NOT EXISTS commitments (
    txid TEXT PRIMARY KEY,
    vaultId TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    pushToken TEXT NOT NULL,
    vaultId TEXT NOT NULL,
    walletId TEXT NOT NULL,
    walletName TEXT NOT NULL,
    vaultNumber INTEGER NOT NULL,
    watchtowerId TEXT NOT NULL,
    locale TEXT,
    firstAttemptAt INTEGER,
    lastAttemptAt INTEGER,
    attemptCount INTEGER NOT NULL DEFAULT 0,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (pushToken, vaultId)
);

CREATE INDEX IF NOT EXISTS notifications_vault_idx ON notifications(vaultId);

CREATE TABLE IF NOT EXISTS network_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_checked_height INTEGER
);
";

/// Opens (or creates) every table this process needs, idempotently. Run once per connection.
pub fn bootstrap(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
