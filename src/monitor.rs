//! The per-network monitor: the engine that reconciles the chain client's view of the world
//! against the local store, drives the trigger state machine, and dispatches the notification
//! scheduler (spec §4.4).

use crate::chain_client::{ChainClient, ChainError, TxStatus};
use crate::config::Config;
use crate::networks::NetworkId;
use crate::push::PushClient;
use crate::scheduler;
use crate::store::{Store, StoreError, TriggerStatus, TriggerTx};
use bitcoin::Txid;
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Minimum confirmations before a transaction is considered permanently in the chain
/// (spec §4.4, "Irreversible depth").
pub const IRREVERSIBLE_THRESHOLD: i64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] scheduler::SchedulerError),
    #[error("store is corrupted: first run found {0} trigger(s) already past 'unchecked'")]
    Corruption(i64),
}

/// Bounded `blockHash -> txids` cache, memoized within and across cycles (spec §4.4.1).
pub struct BlockCache {
    entries: std::collections::HashMap<String, Vec<Txid>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl BlockCache {
    pub fn new(threshold: i64) -> Self {
        BlockCache {
            entries: std::collections::HashMap::new(),
            order: VecDeque::new(),
            capacity: (2 * threshold).max(1) as usize,
        }
    }

    pub fn get(&self, hash: &str) -> Option<&Vec<Txid>> {
        self.entries.get(hash)
    }

    pub fn insert(&mut self, hash: String, txids: Vec<Txid>) {
        if !self.entries.contains_key(&hash) {
            self.order.push_back(hash.clone());
        }
        self.entries.insert(hash, txids);
        if self.order.len() > self.capacity {
            let drop_count = (self.order.len() / 4).max(1);
            for _ in 0..drop_count {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct Monitor {
    pub network: NetworkId,
    store: Store,
    chain: ChainClient,
    push: PushClient,
    cache: BlockCache,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

fn confirmations(current_height: i64, block_height: Option<i64>) -> i64 {
    match block_height {
        Some(h) => current_height - h + 1,
        None => 0,
    }
}

fn status_for_confirmations(confirmations: i64) -> TriggerStatus {
    if confirmations >= IRREVERSIBLE_THRESHOLD {
        TriggerStatus::Irreversible
    } else {
        TriggerStatus::Reversible
    }
}

impl Monitor {
    pub fn new(network: NetworkId, config: &Config, store: Store) -> Self {
        let base_url = config
            .base_url(network)
            .expect("base_url is required for every enabled network");
        Monitor {
            network,
            store,
            chain: ChainClient::new(base_url),
            push: PushClient::new(),
            cache: BlockCache::new(IRREVERSIBLE_THRESHOLD),
        }
    }

    /// Runs cycles forever, sleeping `cycle_interval` between them, until `stop_rx` is
    /// signalled or disconnected. Sleep is interruptible: a stop request cancels it immediately
    /// (spec §4.6).
    pub fn run_loop(mut self, stop_rx: Receiver<()>) {
        loop {
            if let Err(e) = self.run_one_cycle() {
                log::error!("[{}] cycle failed: {}", self.network, e);
                self.cache.clear();
            }

            match stop_rx.recv_timeout(self.network.cycle_interval()) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::info!("[{}] monitor stopping", self.network);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }

    /// One full cycle (spec §4.4 "Cycle algorithm"). Errors are caught here by the caller
    /// (`run_loop`), which clears the cache and retries next cycle; `last_checked_height` is
    /// only written on success (invariant 4).
    pub fn run_one_cycle(&mut self) -> Result<(), MonitorError> {
        log::debug!("[{}] starting cycle", self.network);

        let last_checked_height = self.store.last_checked_height()?;
        let current_height = self.chain.tip_height()?;

        if last_checked_height.is_none() {
            let non_unchecked = self.store.count_non_unchecked()?;
            if non_unchecked != 0 {
                return Err(MonitorError::Corruption(non_unchecked));
            }
        }

        let mempool_txids = self.chain.mempool_txids()?;

        self.check_unchecked_triggers(&mempool_txids, current_height)?;

        let scanned_block_txids = if last_checked_height.unwrap_or(0) > 0 {
            self.scan_window(
                last_checked_height.unwrap(),
                current_height,
                &mempool_txids,
            )?
        } else {
            HashSet::new()
        };

        self.sweep_disappearances(&scanned_block_txids, &mempool_txids)?;

        scheduler::run(
            &self.store,
            &self.chain,
            &self.push,
            self.network.as_str(),
            now_unix(),
        )?;

        self.store.set_last_checked_height(current_height)?;
        log::info!(
            "[{}] cycle complete, last_checked_height = {}",
            self.network,
            current_height
        );
        Ok(())
    }

    /// Step 4: direct check of `unchecked` triggers via `tx_status`.
    fn check_unchecked_triggers(
        &mut self,
        mempool_txids: &HashSet<Txid>,
        current_height: i64,
    ) -> Result<(), MonitorError> {
        let unchecked = self.store.triggers_by_status(TriggerStatus::Unchecked)?;
        for trigger in unchecked {
            let status = self.chain.tx_status(trigger.txid)?;
            let new_status = match status {
                TxStatus::Confirmed { block_height, .. } => {
                    status_for_confirmations(confirmations(current_height, Some(block_height)))
                }
                TxStatus::Unconfirmed => {
                    if mempool_txids.contains(&trigger.txid) {
                        status_for_confirmations(0)
                    } else {
                        TriggerStatus::Unseen
                    }
                }
                TxStatus::Absent => {
                    if mempool_txids.contains(&trigger.txid) {
                        status_for_confirmations(0)
                    } else {
                        TriggerStatus::Unseen
                    }
                }
            };
            self.transition(&trigger, new_status)?;
        }
        Ok(())
    }

    /// Step 5: window scan `[last_checked_height - threshold, current_height]`.
    fn scan_window(
        &mut self,
        last_checked_height: i64,
        current_height: i64,
        mempool_txids: &HashSet<Txid>,
    ) -> Result<HashSet<Txid>, MonitorError> {
        let start = (last_checked_height - IRREVERSIBLE_THRESHOLD).max(0);
        let mut scanned_block_txids = HashSet::new();
        let mut per_height_txids: Vec<(i64, Vec<Txid>)> = Vec::new();

        for height in start..=current_height {
            let hash = self.chain.block_hash(height)?;
            let txids = match self.cache.get(&hash) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.chain.block_txids(&hash)?;
                    self.cache.insert(hash, fetched.clone());
                    fetched
                }
            };
            scanned_block_txids.extend(txids.iter().copied());
            per_height_txids.push((height, txids));
        }

        let watched = self
            .store
            .triggers_by_statuses(&[TriggerStatus::Unseen, TriggerStatus::Reversible])?;

        for trigger in watched {
            let mut matched = false;
            for (height, txids) in &per_height_txids {
                if txids.contains(&trigger.txid) {
                    let new_status =
                        status_for_confirmations(confirmations(current_height, Some(*height)));
                    self.transition(&trigger, new_status)?;
                    matched = true;
                    break;
                }
            }
            if !matched
                && trigger.status == TriggerStatus::Unseen
                && mempool_txids.contains(&trigger.txid)
            {
                self.transition(&trigger, TriggerStatus::Reversible)?;
            }
        }

        Ok(scanned_block_txids)
    }

    /// Step 6: any `reversible` trigger absent from both the scanned window and the mempool has
    /// disappeared (reorg or mempool purge); reset it to `unseen` and clear delivery
    /// bookkeeping for its vault (invariant 3).
    fn sweep_disappearances(
        &mut self,
        scanned_block_txids: &HashSet<Txid>,
        mempool_txids: &HashSet<Txid>,
    ) -> Result<(), MonitorError> {
        let reversible = self.store.triggers_by_status(TriggerStatus::Reversible)?;
        for trigger in reversible {
            if !scanned_block_txids.contains(&trigger.txid) && !mempool_txids.contains(&trigger.txid) {
                log::info!(
                    "[{}] trigger '{}' of vault '{}' disappeared, resetting to unseen",
                    self.network,
                    trigger.txid,
                    trigger.vault_id
                );
                self.store
                    .update_trigger_status(trigger.txid, TriggerStatus::Unseen)?;
                self.store.reset_delivery_bookkeeping(&trigger.vault_id)?;
            }
        }
        Ok(())
    }

    fn transition(&mut self, trigger: &TriggerTx, new_status: TriggerStatus) -> Result<(), MonitorError> {
        if trigger.status == new_status {
            return Ok(());
        }
        if trigger.status == TriggerStatus::Irreversible {
            log::warn!(
                "[{}] vault '{}' trigger already irreversible; re-observing it is a known \
                 terminal-state limitation (spec: reorg of an irreversible tx goes unnoticed)",
                self.network,
                trigger.vault_id
            );
            return Ok(());
        }
        log::debug!(
            "[{}] trigger '{}' of vault '{}': {:?} -> {:?}",
            self.network,
            trigger.txid,
            trigger.vault_id,
            trigger.status,
            new_status
        );
        self.store.update_trigger_status(trigger.txid, new_status)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_cache_evicts_oldest_quarter_past_capacity() {
        let mut cache = BlockCache::new(2); // capacity = 4
        for i in 0..6 {
            cache.insert(format!("hash{i}"), vec![]);
        }
        assert!(cache.entries.len() <= 4);
        assert!(cache.get("hash0").is_none());
        assert!(cache.get("hash5").is_some());
    }

    #[test]
    fn confirmations_are_computed_from_block_height() {
        assert_eq!(confirmations(100, Some(100)), 1);
        assert_eq!(confirmations(104, Some(101)), 4);
        assert_eq!(confirmations(100, None), 0);
    }

    #[test]
    fn threshold_boundary_flips_to_irreversible() {
        assert_eq!(status_for_confirmations(3), TriggerStatus::Reversible);
        assert_eq!(status_for_confirmations(4), TriggerStatus::Irreversible);
    }

    #[test]
    fn transition_never_moves_an_already_irreversible_trigger() {
        use std::str::FromStr;

        let mut store = Store::open_in_memory().unwrap();
        let t = Txid::from_str(&"22".repeat(32)).unwrap();
        let reg = crate::store::VaultRegistration {
            push_token: "tok".into(),
            wallet_id: "w".into(),
            wallet_name: "W".into(),
            watchtower_id: "wt".into(),
            locale: None,
            vault_id: "v1".into(),
            vault_number: 0,
            trigger_txids: vec![t],
            commitment_txid: None,
        };
        store.register_vault(&reg).unwrap();
        store.update_trigger_status(t, TriggerStatus::Irreversible).unwrap();

        let mut monitor = Monitor {
            network: NetworkId::Regtest,
            store,
            chain: ChainClient::new("http://example.invalid".into()),
            push: PushClient::new(),
            cache: BlockCache::new(IRREVERSIBLE_THRESHOLD),
        };

        let trigger = monitor.store.trigger_by_txid(t).unwrap().unwrap();
        monitor.transition(&trigger, TriggerStatus::Unseen).unwrap();

        let after = monitor.store.trigger_by_txid(t).unwrap().unwrap();
        assert_eq!(after.status, TriggerStatus::Irreversible);
    }
}
