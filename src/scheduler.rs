//! Notification scheduler (spec §4.5): selects due registrations, gates the first attempt on
//! spend-proof, composes localized messages, delivers, and records attempt bookkeeping.

use crate::chain_client::ChainClient;
use crate::commitment;
use crate::locale;
use crate::push::PushClient;
use crate::store::{NotificationRegistration, Store, TriggerStatus, TriggerTx};
use std::time::Duration;

const MAX_RETRY_WINDOW_SECS: i64 = 7 * 86_400;
const FIRST_DAY_SECS: i64 = 86_400;
const FIRST_DAY_RETRY_SECS: i64 = 21_600;
const AFTER_FIRST_DAY_RETRY_SECS: i64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// True iff the registration is due for an attempt right now, given its joined trigger's status
/// (spec §4.5 "Selection query"). Trigger-less registrations (no trigger yet observed) are never
/// due.
fn is_due(reg: &NotificationRegistration, trigger: Option<&TriggerTx>, now: i64) -> bool {
    if reg.acknowledged {
        return false;
    }
    let Some(trigger) = trigger else {
        return false;
    };
    if !matches!(
        trigger.status,
        TriggerStatus::Reversible | TriggerStatus::Irreversible
    ) {
        return false;
    }

    if let Some(first) = reg.first_attempt_at {
        if now - first >= MAX_RETRY_WINDOW_SECS {
            return false;
        }
    }

    if reg.attempt_count == 0 {
        return true;
    }

    let first = match reg.first_attempt_at {
        Some(f) => f,
        None => return false,
    };
    let last = match reg.last_attempt_at {
        Some(l) => l,
        None => return false,
    };

    if now - first <= FIRST_DAY_SECS {
        now - last >= FIRST_DAY_RETRY_SECS
    } else {
        now - last >= AFTER_FIRST_DAY_RETRY_SECS
    }
}

/// Runs one pass of the scheduler over every non-acknowledged registration in `store`
/// (spec §4.4 step 7). Delivery failures are logged and do not roll back bookkeeping (spec
/// §4.5 "Delivery").
pub fn run(
    store: &Store,
    chain: &ChainClient,
    push: &PushClient,
    network_id: &str,
    now: i64,
) -> Result<(), SchedulerError> {
    let candidates = store.candidate_notifications()?;

    for (reg, trigger) in candidates {
        let trigger = match trigger.as_ref() {
            Some(t) => t,
            None => continue,
        };
        if !is_due(&reg, Some(trigger), now) {
            continue;
        }

        if reg.attempt_count == 0 {
            if let Some(commitment_txid) = trigger.commitment_txid {
                if !commitment::verify_spend(trigger.txid, commitment_txid, chain) {
                    log::debug!(
                        "Skipping first notification for vault '{}': spend-proof not yet available",
                        reg.vault_id
                    );
                    continue;
                }
            }
        }

        // Bookkeeping is persisted before the push is sent (spec §4.5).
        if let Err(e) = store.record_attempt(&reg.push_token, &reg.vault_id, now) {
            log::error!(
                "Failed to record notification attempt for vault '{}': {}",
                reg.vault_id,
                e
            );
            continue;
        }

        let first_attempt_at = reg.first_attempt_at.unwrap_or(now);
        let elapsed = Duration::from_secs((now - first_attempt_at).max(0) as u64);
        let locale = locale::normalize(reg.locale.as_deref());
        let time_since = locale::human_time_since(elapsed, locale);
        let message = locale::compose(locale, reg.vault_number, &reg.wallet_name, &time_since);

        let data = serde_json::json!({
            "vaultId": reg.vault_id,
            "walletId": reg.wallet_id,
            "walletName": reg.wallet_name,
            "vaultNumber": reg.vault_number,
            "watchtowerId": reg.watchtower_id,
            "txid": trigger.txid.to_string(),
            "attemptCount": reg.attempt_count + 1,
            "firstDetectedAt": first_attempt_at,
            "networkId": network_id,
        });

        match push.send(&reg.push_token, &message.title, &message.body, data) {
            Ok(()) => log::info!(
                "Delivered notification for vault '{}' to a registered device (attempt {})",
                reg.vault_id,
                reg.attempt_count + 1
            ),
            Err(e) => log::warn!(
                "Push delivery failed for vault '{}': {} (will retry on schedule)",
                reg.vault_id,
                e
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TriggerStatus;

    fn trigger(status: TriggerStatus) -> TriggerTx {
        use bitcoin::Txid;
        use std::str::FromStr;
        TriggerTx {
            txid: Txid::from_str(&"11".repeat(32)).unwrap(),
            vault_id: "v1".into(),
            status,
            commitment_txid: None,
        }
    }

    fn registration(
        attempt_count: i64,
        first: Option<i64>,
        last: Option<i64>,
        acknowledged: bool,
    ) -> NotificationRegistration {
        NotificationRegistration {
            push_token: "tok".into(),
            vault_id: "v1".into(),
            wallet_id: "w".into(),
            wallet_name: "Wallet".into(),
            vault_number: 0,
            watchtower_id: "wt".into(),
            locale: None,
            first_attempt_at: first,
            last_attempt_at: last,
            attempt_count,
            acknowledged,
        }
    }

    #[test]
    fn first_attempt_is_due_when_trigger_reversible() {
        let reg = registration(0, None, None, false);
        assert!(is_due(&reg, Some(&trigger(TriggerStatus::Reversible)), 1_000));
    }

    #[test]
    fn not_due_when_trigger_unseen() {
        let reg = registration(0, None, None, false);
        assert!(!is_due(&reg, Some(&trigger(TriggerStatus::Unseen)), 1_000));
    }

    #[test]
    fn acknowledged_is_never_due() {
        let reg = registration(1, Some(0), Some(0), true);
        assert!(!is_due(&reg, Some(&trigger(TriggerStatus::Irreversible)), 1_000));
    }

    #[test]
    fn second_attempt_waits_six_hours_in_first_day() {
        let reg = registration(1, Some(0), Some(0), false);
        assert!(!is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            FIRST_DAY_RETRY_SECS - 1
        ));
        assert!(is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            FIRST_DAY_RETRY_SECS
        ));
    }

    #[test]
    fn after_first_day_waits_twenty_four_hours() {
        let reg = registration(2, Some(0), Some(FIRST_DAY_SECS + 1000), false);
        let now_not_due = FIRST_DAY_SECS + 1000 + AFTER_FIRST_DAY_RETRY_SECS - 1;
        let now_due = FIRST_DAY_SECS + 1000 + AFTER_FIRST_DAY_RETRY_SECS;
        assert!(!is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            now_not_due
        ));
        assert!(is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            now_due
        ));
    }

    #[test]
    fn past_max_retry_window_is_permanently_skipped() {
        let reg = registration(1, Some(0), Some(0), false);
        assert!(!is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            MAX_RETRY_WINDOW_SECS + 1
        ));
    }

    #[test]
    fn max_retry_window_boundary_instant_is_excluded() {
        let reg = registration(1, Some(0), Some(0), false);
        assert!(!is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            MAX_RETRY_WINDOW_SECS
        ));
        assert!(is_due(
            &reg,
            Some(&trigger(TriggerStatus::Reversible)),
            MAX_RETRY_WINDOW_SECS - 1
        ));
    }
}
