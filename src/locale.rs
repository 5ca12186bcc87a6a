//! Localized notification message templates (data, not logic — spec §4.5, out of the CORE's
//! scope per spec §1 but kept here as the minimal data this service needs to compose a push).

use std::time::Duration;

pub struct Message {
    pub title: String,
    pub body: String,
}

/// Normalizes a locale tag to its two-letter prefix, falling back to `en` (spec §4.5).
pub fn normalize(locale: Option<&str>) -> &'static str {
    match locale.map(|l| l.to_lowercase()) {
        Some(ref l) if l.starts_with("es") => "es",
        _ => "en",
    }
}

/// "just now" for the first attempt, otherwise a localized human-readable duration
/// (spec §4.5: `timeSince` placeholder).
pub fn human_time_since(elapsed: Duration, locale: &str) -> String {
    let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
    if elapsed.num_seconds() == 0 {
        return match locale {
            "es" => "ahora mismo".to_string(),
            _ => "just now".to_string(),
        };
    }

    let (value, en_unit, es_unit) = if elapsed.num_hours() < 1 {
        (elapsed.num_minutes(), "minute", "minuto")
    } else if elapsed.num_days() < 1 {
        (elapsed.num_hours(), "hour", "hora")
    } else {
        (elapsed.num_days(), "day", "dia")
    };
    let value = value.max(1);

    match locale {
        "es" => format!(
            "hace {} {}{}",
            value,
            es_unit,
            if value == 1 { "" } else { "s" }
        ),
        _ => format!(
            "{} {}{} ago",
            value,
            en_unit,
            if value == 1 { "" } else { "s" }
        ),
    }
}

/// Composes the title/body for a trigger notification (spec §4.5 placeholders:
/// `vaultNumber`, `walletName`, `timeSince`).
pub fn compose(locale: &str, vault_number: i64, wallet_name: &str, time_since: &str) -> Message {
    match locale {
        "es" => Message {
            title: "Alerta de caja fuerte".to_string(),
            body: format!(
                "Se detecto actividad en la caja fuerte #{} de {} ({}).",
                vault_number, wallet_name, time_since
            ),
        },
        _ => Message {
            title: "Vault alert".to_string(),
            body: format!(
                "Activity detected on vault #{} of {} ({}).",
                vault_number, wallet_name, time_since
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_locale_falls_back_to_en() {
        assert_eq!(normalize(Some("fr-FR")), "en");
        assert_eq!(normalize(None), "en");
        assert_eq!(normalize(Some("es-MX")), "es");
    }

    #[test]
    fn first_attempt_is_just_now() {
        assert_eq!(human_time_since(Duration::from_secs(0), "en"), "just now");
        assert_eq!(human_time_since(Duration::from_secs(0), "es"), "ahora mismo");
    }
}
