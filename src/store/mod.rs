//! The per-network persistent store: `notifications`, `vault_txids`, `commitments`,
//! `network_state` (spec §3, §4.3).
//!
//! One `Store` wraps one SQLite connection to one network's `watchtower.{networkId}.sqlite`
//! file. The monitor thread and the HTTP registration/ack handlers each hold their own `Store`
//! (their own connection) onto the same file; concurrency between them is left to SQLite's WAL
//! mode and a 10s busy timeout (spec §5), not an in-process lock.

mod schema;

use bitcoin::Txid;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed txid stored in database: {0}")]
    BadTxid(String),
    #[error("commitment '{0}' is already bound to a different vault")]
    CommitmentReused(Txid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Unchecked,
    Unseen,
    Reversible,
    Irreversible,
}

impl TriggerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Unchecked => "unchecked",
            TriggerStatus::Unseen => "unseen",
            TriggerStatus::Reversible => "reversible",
            TriggerStatus::Irreversible => "irreversible",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "unchecked" => Some(TriggerStatus::Unchecked),
            "unseen" => Some(TriggerStatus::Unseen),
            "reversible" => Some(TriggerStatus::Reversible),
            "irreversible" => Some(TriggerStatus::Irreversible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerTx {
    pub txid: Txid,
    pub vault_id: String,
    pub status: TriggerStatus,
    pub commitment_txid: Option<Txid>,
}

#[derive(Debug, Clone)]
pub struct NotificationRegistration {
    pub push_token: String,
    pub vault_id: String,
    pub wallet_id: String,
    pub wallet_name: String,
    pub vault_number: i64,
    pub watchtower_id: String,
    pub locale: Option<String>,
    pub first_attempt_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub attempt_count: i64,
    pub acknowledged: bool,
}

/// Everything needed to atomically register one vault (spec §4.3): the commitment binding (if
/// any), the notification row, and the set of trigger txids.
#[derive(Debug, Clone)]
pub struct VaultRegistration {
    pub push_token: String,
    pub wallet_id: String,
    pub wallet_name: String,
    pub watchtower_id: String,
    pub locale: Option<String>,
    pub vault_id: String,
    pub vault_number: i64,
    pub trigger_txids: Vec<Txid>,
    /// Already-authorized commitment txid for this vault, if any (spec §4.2 runs before this).
    pub commitment_txid: Option<Txid>,
}

pub struct Store {
    conn: Connection,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

fn parse_txid(s: &str) -> Result<Txid, StoreError> {
    Txid::from_str(s).map_err(|_| StoreError::BadTxid(s.to_string()))
}

impl Store {
    /// Opens (creating if absent) the SQLite file for `network` under `db_folder`, sets WAL mode
    /// and a 10s busy timeout (spec §5), and bootstraps the schema.
    pub fn open(db_folder: &Path, network: crate::networks::NetworkId) -> Result<Self, StoreError> {
        let path = db_folder.join(network.store_filename());
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::bootstrap(&conn)?;
        Ok(Store { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::bootstrap(&conn)?;
        Ok(Store { conn })
    }

    // ---- network_state -----------------------------------------------------------------

    pub fn last_checked_height(&self) -> Result<Option<i64>, StoreError> {
        let height: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT last_checked_height FROM network_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(height.flatten())
    }

    pub fn set_last_checked_height(&self, height: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO network_state (id, last_checked_height) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_checked_height = excluded.last_checked_height",
            params![height],
        )?;
        Ok(())
    }

    // ---- commitments --------------------------------------------------------------------

    /// The vault id bound to `txid`, if a commitment has been registered for it (spec §4.2).
    pub fn commitment_vault_id(&self, txid: Txid) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT vaultId FROM commitments WHERE txid = ?1",
                params![txid.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ---- vault registration (atomic) -----------------------------------------------------

    /// Registers a vault: commitment row (if any), notification row, and trigger rows, all in
    /// one transaction (spec §4.3 invariant: all-or-nothing).
    ///
    /// Re-registering the same `(pushToken, vaultId)` is an idempotent no-op (`INSERT OR
    /// IGNORE`). Re-registering an existing `txid` under a different `vaultId` is silently
    /// ignored for that txid (first write wins, spec §3 invariant on `TriggerTx`); the caller is
    /// expected to log a warning when the vault is already `irreversible` (spec invariant 5).
    pub fn register_vault(&mut self, reg: &VaultRegistration) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;

        if let Some(commitment_txid) = reg.commitment_txid {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT vaultId FROM commitments WHERE txid = ?1",
                    params![commitment_txid.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(ref v) if v == &reg.vault_id => {}
                Some(_) => return Err(StoreError::CommitmentReused(commitment_txid)),
                None => {
                    tx.execute(
                        "INSERT INTO commitments (txid, vaultId, created_at) VALUES (?1, ?2, ?3)",
                        params![commitment_txid.to_string(), reg.vault_id, now_unix()],
                    )?;
                }
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO notifications
                (pushToken, vaultId, walletId, walletName, vaultNumber, watchtowerId, locale,
                 firstAttemptAt, lastAttemptAt, attemptCount, acknowledged)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, 0, 0)",
            params![
                reg.push_token,
                reg.vault_id,
                reg.wallet_id,
                reg.wallet_name,
                reg.vault_number,
                reg.watchtower_id,
                reg.locale,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO vault_txids (txid, vaultId, status, commitmentTxid)
                 VALUES (?1, ?2, 'unchecked', ?3)",
            )?;
            for txid in &reg.trigger_txids {
                let commitment = reg.commitment_txid.map(|c| c.to_string());
                stmt.execute(params![txid.to_string(), reg.vault_id, commitment])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// True iff any trigger of this vault has already reached `irreversible` and has a
    /// notification with at least one attempt (spec invariant 5: "spent" vault).
    pub fn vault_already_spent_and_notified(&self, vault_id: &str) -> Result<bool, StoreError> {
        let irreversible: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vault_txids WHERE vaultId = ?1 AND status = 'irreversible'",
            params![vault_id],
            |row| row.get(0),
        )?;
        if irreversible == 0 {
            return Ok(false);
        }
        let notified: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE vaultId = ?1 AND attemptCount > 0",
            params![vault_id],
            |row| row.get(0),
        )?;
        Ok(notified > 0)
    }

    // ---- triggers -------------------------------------------------------------------------

    pub fn triggers_by_status(&self, status: TriggerStatus) -> Result<Vec<TriggerTx>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT txid, vaultId, status, commitmentTxid FROM vault_txids WHERE status = ?1",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(txid, vault_id, status, commitment)| {
                build_trigger(txid, vault_id, status, commitment)
            })
            .collect()
    }

    pub fn triggers_by_statuses(
        &self,
        statuses: &[TriggerStatus],
    ) -> Result<Vec<TriggerTx>, StoreError> {
        let mut out = Vec::new();
        for status in statuses {
            out.extend(self.triggers_by_status(*status)?);
        }
        Ok(out)
    }

    pub fn trigger_by_txid(&self, txid: Txid) -> Result<Option<TriggerTx>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT txid, vaultId, status, commitmentTxid FROM vault_txids WHERE txid = ?1",
                params![txid.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(txid, vault_id, status, commitment)| {
            build_trigger(txid, vault_id, status, commitment)
        })
        .transpose()
    }

    pub fn update_trigger_status(
        &self,
        txid: Txid,
        status: TriggerStatus,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE vault_txids SET status = ?1 WHERE txid = ?2",
            params![status.as_str(), txid.to_string()],
        )?;
        Ok(())
    }

    /// Count of `vault_txids` rows whose status is not `unchecked` (spec §4.4 first-run guard).
    pub fn count_non_unchecked(&self) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM vault_txids WHERE status != 'unchecked'",
            [],
            |row| row.get(0),
        )?)
    }

    // ---- notifications ---------------------------------------------------------------------

    /// All non-acknowledged registrations, joined to the single most-relevant trigger of their
    /// vault (prefers `irreversible` over `reversible` over `unseen`/`unchecked`, then lowest
    /// txid for determinism). A vault may bind several trigger txids; the scheduler only needs
    /// one representative trigger to drive notification content and the spend-proof gate.
    pub fn candidate_notifications(
        &self,
    ) -> Result<Vec<(NotificationRegistration, Option<TriggerTx>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT pushToken, vaultId, walletId, walletName, vaultNumber, watchtowerId, locale,
                    firstAttemptAt, lastAttemptAt, attemptCount, acknowledged
             FROM notifications WHERE acknowledged = 0",
        )?;
        let regs = stmt
            .query_map([], row_to_registration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(regs.len());
        for reg in regs {
            let trigger = self.best_trigger_for_vault(&reg.vault_id)?;
            out.push((reg, trigger));
        }
        Ok(out)
    }

    fn best_trigger_for_vault(&self, vault_id: &str) -> Result<Option<TriggerTx>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT txid, vaultId, status, commitmentTxid FROM vault_txids WHERE vaultId = ?1
             ORDER BY CASE status
                WHEN 'irreversible' THEN 0
                WHEN 'reversible' THEN 1
                WHEN 'unseen' THEN 2
                ELSE 3
             END ASC, txid ASC
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![vault_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .optional()?;
        row.map(|(txid, vault_id, status, commitment)| {
            build_trigger(txid, vault_id, status, commitment)
        })
        .transpose()
    }

    /// Records an attempt: first attempt sets `firstAttemptAt = lastAttemptAt = now,
    /// attemptCount = 1`; later attempts bump `lastAttemptAt` and increment the counter (spec
    /// §4.5). Must be called before the push is actually sent.
    pub fn record_attempt(
        &self,
        push_token: &str,
        vault_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE notifications SET
                firstAttemptAt = COALESCE(firstAttemptAt, ?3),
                lastAttemptAt = ?3,
                attemptCount = attemptCount + 1
             WHERE pushToken = ?1 AND vaultId = ?2",
            params![push_token, vault_id, now],
        )?;
        Ok(())
    }

    /// Sets `acknowledged = 1`. Returns `false` if no such registration exists (404 to the HTTP
    /// caller).
    pub fn set_acknowledged(&self, push_token: &str, vault_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE notifications SET acknowledged = 1 WHERE pushToken = ?1 AND vaultId = ?2",
            params![push_token, vault_id],
        )?;
        Ok(changed > 0)
    }

    /// Resets delivery bookkeeping (not `acknowledged`) for every registration of `vault_id`
    /// (spec invariant 3, triggered by the disappearance sweep in spec §4.4 step 6).
    pub fn reset_delivery_bookkeeping(&self, vault_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE notifications SET firstAttemptAt = NULL, lastAttemptAt = NULL, attemptCount = 0
             WHERE vaultId = ?1",
            params![vault_id],
        )?;
        Ok(())
    }

    /// Unacknowledged, already-attempted notifications for `push_token` whose trigger is
    /// `reversible` or `irreversible` (spec §6.1 `/watchtower/notifications`).
    pub fn notifications_for_token(
        &self,
        push_token: &str,
    ) -> Result<Vec<NotificationRegistration>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT n.pushToken, n.vaultId, n.walletId, n.walletName, n.vaultNumber,
                    n.watchtowerId, n.locale, n.firstAttemptAt, n.lastAttemptAt,
                    n.attemptCount, n.acknowledged
             FROM notifications n
             WHERE n.pushToken = ?1 AND n.acknowledged = 0 AND n.attemptCount > 0
               AND EXISTS (
                   SELECT 1 FROM vault_txids v
                   WHERE v.vaultId = n.vaultId AND v.status IN ('reversible', 'irreversible')
               )",
        )?;
        let rows = stmt
            .query_map(params![push_token], row_to_registration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_trigger(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
    ))
}

fn build_trigger(
    txid: String,
    vault_id: String,
    status: String,
    commitment: Option<String>,
) -> Result<TriggerTx, StoreError> {
    Ok(TriggerTx {
        txid: parse_txid(&txid)?,
        vault_id,
        status: TriggerStatus::from_str(&status)
            .ok_or_else(|| StoreError::BadTxid(format!("unknown status '{}'", status)))?,
        commitment_txid: commitment.map(|c| parse_txid(&c)).transpose()?,
    })
}

fn row_to_registration(row: &rusqlite::Row) -> rusqlite::Result<NotificationRegistration> {
    Ok(NotificationRegistration {
        push_token: row.get(0)?,
        vault_id: row.get(1)?,
        wallet_id: row.get(2)?,
        wallet_name: row.get(3)?,
        vault_number: row.get(4)?,
        watchtower_id: row.get(5)?,
        locale: row.get(6)?,
        first_attempt_at: row.get(7)?,
        last_attempt_at: row.get(8)?,
        attempt_count: row.get(9)?,
        acknowledged: row.get::<_, i64>(10)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn txid(byte: u8) -> Txid {
        let hex = format!("{:02x}", byte).repeat(32);
        Txid::from_str(&hex).unwrap()
    }

    fn random_txid() -> Txid {
        let bytes: Vec<u8> = (0..32).map(|_| fastrand::u8(..)).collect();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Txid::from_str(&hex).unwrap()
    }

    #[test]
    fn registering_many_random_vaults_keeps_counts_consistent() {
        let mut store = Store::open_in_memory().unwrap();
        let vault_count = 25;
        for i in 0..vault_count {
            let reg = VaultRegistration {
                push_token: format!("tok{i}"),
                wallet_id: "w".into(),
                wallet_name: "Wallet".into(),
                watchtower_id: "wt".into(),
                locale: None,
                vault_id: format!("v{i}"),
                vault_number: i,
                trigger_txids: vec![random_txid(), random_txid()],
                commitment_txid: None,
            };
            store.register_vault(&reg).unwrap();
        }
        let unchecked = store.triggers_by_status(TriggerStatus::Unchecked).unwrap();
        assert_eq!(unchecked.len(), (vault_count * 2) as usize);
        assert_eq!(store.candidate_notifications().unwrap().len(), vault_count as usize);
    }

    #[test]
    fn height_round_trips() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_checked_height().unwrap(), None);
        store.set_last_checked_height(42).unwrap();
        assert_eq!(store.last_checked_height().unwrap(), Some(42));
        store.set_last_checked_height(43).unwrap();
        assert_eq!(store.last_checked_height().unwrap(), Some(43));
    }

    #[test]
    fn register_vault_is_atomic_and_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        let reg = VaultRegistration {
            push_token: "tok1".into(),
            wallet_id: "w1".into(),
            wallet_name: "My Wallet".into(),
            watchtower_id: "wt1".into(),
            locale: Some("en".into()),
            vault_id: "v1".into(),
            vault_number: 0,
            trigger_txids: vec![txid(1), txid(2)],
            commitment_txid: None,
        };
        store.register_vault(&reg).unwrap();
        store.register_vault(&reg).unwrap();

        let triggers = store.triggers_by_status(TriggerStatus::Unchecked).unwrap();
        assert_eq!(triggers.len(), 2);

        let candidates = store.candidate_notifications().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.attempt_count, 0);
    }

    #[test]
    fn same_txid_under_different_vault_is_first_write_wins() {
        let mut store = Store::open_in_memory().unwrap();
        let t = txid(9);
        let reg1 = VaultRegistration {
            push_token: "tok1".into(),
            wallet_id: "w1".into(),
            wallet_name: "Wallet 1".into(),
            watchtower_id: "wt1".into(),
            locale: None,
            vault_id: "v1".into(),
            vault_number: 0,
            trigger_txids: vec![t],
            commitment_txid: None,
        };
        let mut reg2 = reg1.clone();
        reg2.vault_id = "v2".into();
        reg2.push_token = "tok2".into();

        store.register_vault(&reg1).unwrap();
        store.register_vault(&reg2).unwrap();

        let trigger = store.trigger_by_txid(t).unwrap().unwrap();
        assert_eq!(trigger.vault_id, "v1");
    }

    #[test]
    fn commitment_reuse_under_different_vault_fails() {
        let mut store = Store::open_in_memory().unwrap();
        let c = txid(5);
        let mut reg1 = VaultRegistration {
            push_token: "tok1".into(),
            wallet_id: "w1".into(),
            wallet_name: "Wallet 1".into(),
            watchtower_id: "wt1".into(),
            locale: None,
            vault_id: "v1".into(),
            vault_number: 0,
            trigger_txids: vec![txid(1)],
            commitment_txid: Some(c),
        };
        store.register_vault(&reg1).unwrap();

        reg1.vault_id = "v2".into();
        reg1.trigger_txids = vec![txid(2)];
        let err = store.register_vault(&reg1).unwrap_err();
        assert!(matches!(err, StoreError::CommitmentReused(_)));
    }

    #[test]
    fn reset_bookkeeping_clears_all_three_fields_together() {
        let mut store = Store::open_in_memory().unwrap();
        let reg = VaultRegistration {
            push_token: "tok1".into(),
            wallet_id: "w1".into(),
            wallet_name: "Wallet 1".into(),
            watchtower_id: "wt1".into(),
            locale: None,
            vault_id: "v1".into(),
            vault_number: 0,
            trigger_txids: vec![txid(1)],
            commitment_txid: None,
        };
        store.register_vault(&reg).unwrap();
        store.record_attempt("tok1", "v1", 1000).unwrap();

        let candidates = store.candidate_notifications().unwrap();
        assert_eq!(candidates[0].0.attempt_count, 1);

        store.reset_delivery_bookkeeping("v1").unwrap();
        let candidates = store.candidate_notifications().unwrap();
        assert_eq!(candidates[0].0.attempt_count, 0);
        assert_eq!(candidates[0].0.first_attempt_at, None);
        assert_eq!(candidates[0].0.last_attempt_at, None);
    }

    #[test]
    fn ack_is_terminal() {
        let mut store = Store::open_in_memory().unwrap();
        let reg = VaultRegistration {
            push_token: "tok1".into(),
            wallet_id: "w1".into(),
            wallet_name: "Wallet 1".into(),
            watchtower_id: "wt1".into(),
            locale: None,
            vault_id: "v1".into(),
            vault_number: 0,
            trigger_txids: vec![txid(1)],
            commitment_txid: None,
        };
        store.register_vault(&reg).unwrap();
        assert!(store.set_acknowledged("tok1", "v1").unwrap());
        assert_eq!(store.candidate_notifications().unwrap().len(), 0);
        assert!(!store.set_acknowledged("tok1", "nonexistent").unwrap());
    }
}
