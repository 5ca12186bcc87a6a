//! Network identifiers and their per-network defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One of the Bitcoin-family networks this watchtower can monitor.
///
/// Each enabled network gets its own [`crate::monitor::Monitor`], its own SQLite file, and its
/// own in-memory cache and rate-limiter state; nothing is shared across networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkId {
    Bitcoin,
    Testnet,
    Tape,
    Regtest,
}

impl NetworkId {
    pub const ALL: [NetworkId; 4] = [
        NetworkId::Bitcoin,
        NetworkId::Testnet,
        NetworkId::Tape,
        NetworkId::Regtest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkId::Bitcoin => "bitcoin",
            NetworkId::Testnet => "testnet",
            NetworkId::Tape => "tape",
            NetworkId::Regtest => "regtest",
        }
    }

    /// The compiled-in default base URL for the upstream Esplora-compatible API, or `None` for
    /// `regtest` which must be supplied by the operator at startup (spec §4.1).
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            NetworkId::Bitcoin => Some("https://blockstream.info/api"),
            NetworkId::Testnet => Some("https://mempool.space/testnet/api"),
            NetworkId::Tape => Some("https://tape.rewindbitcoin.com/api"),
            NetworkId::Regtest => None,
        }
    }

    /// Cycle interval: 60s default, 30s for regtest (spec §4.6).
    pub fn cycle_interval(&self) -> Duration {
        match self {
            NetworkId::Regtest => Duration::from_secs(30),
            _ => Duration::from_secs(60),
        }
    }

    /// The `rust-bitcoin` network parameters used to decode addresses for this network.
    ///
    /// `tape` is a third-party testnet-like network (rewindbitcoin.com) with no dedicated
    /// `bitcoin::Network` variant; its addresses share testnet encoding, so we decode under
    /// `Network::Testnet`. Recorded as an explicit decision in DESIGN.md.
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            NetworkId::Bitcoin => bitcoin::Network::Bitcoin,
            NetworkId::Testnet => bitcoin::Network::Testnet,
            NetworkId::Tape => bitcoin::Network::Testnet,
            NetworkId::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// The per-network SQLite filename under the configured db folder (spec §6.4).
    pub fn store_filename(&self) -> String {
        format!("watchtower.{}.sqlite", self.as_str())
    }

    /// The authorized-addresses database filename under the configured db folder (spec §4.2).
    pub fn addresses_filename(&self) -> String {
        format!("{}.sqlite", self.as_str())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a known network id")]
pub struct UnknownNetworkId(pub String);

impl FromStr for NetworkId {
    type Err = UnknownNetworkId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(NetworkId::Bitcoin),
            "testnet" => Ok(NetworkId::Testnet),
            "tape" => Ok(NetworkId::Tape),
            "regtest" => Ok(NetworkId::Regtest),
            other => Err(UnknownNetworkId(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_str() {
        for net in NetworkId::ALL {
            assert_eq!(net.as_str().parse::<NetworkId>().unwrap(), net);
        }
    }

    #[test]
    fn regtest_has_no_default_url() {
        assert!(NetworkId::Regtest.default_base_url().is_none());
        for net in [NetworkId::Bitcoin, NetworkId::Testnet, NetworkId::Tape] {
            assert!(net.default_base_url().is_some());
        }
    }

    #[test]
    fn regtest_cycle_is_faster() {
        assert!(NetworkId::Regtest.cycle_interval() < NetworkId::Bitcoin.cycle_interval());
    }
}
