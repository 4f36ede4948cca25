// Nonce allocation for the shared admin signer.
//
// Every operation runs under one async mutex, so no two batch pipelines can
// observe the same nonce. The network is only asked for a seed on first use
// (or after a rewind); from then on the last issued value is incremented,
// since node-reported pending counts lag under load.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, TxHash};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainResult};

#[derive(Debug, Clone)]
struct InFlight {
    tx_hash: Option<TxHash>,
    since: Instant,
}

#[derive(Debug, Default)]
struct SignerNonces {
    /// None until seeded, or after a rewind
    next: Option<u64>,
    in_flight: BTreeMap<u64, InFlight>,
}

/// Snapshot of one reserved nonce, for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct InFlightNonce {
    pub nonce: u64,
    pub tx_hash: Option<String>,
    pub age_secs: u64,
}

pub struct NonceAllocator {
    chain: Arc<dyn ChainClient>,
    signers: Mutex<HashMap<Address, SignerNonces>>,
}

impl NonceAllocator {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            signers: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next free nonce for `signer`
    pub async fn allocate(&self, signer: Address) -> ChainResult<u64> {
        let mut signers = self.signers.lock().await;
        let entry = signers.entry(signer).or_default();

        let mut candidate = match entry.next {
            Some(next) => next,
            None => self.seed(signer).await?,
        };
        while entry.in_flight.contains_key(&candidate) {
            candidate += 1;
        }

        entry.in_flight.insert(
            candidate,
            InFlight {
                tx_hash: None,
                since: Instant::now(),
            },
        );
        entry.next = Some(candidate + 1);

        debug!(%signer, nonce = candidate, in_flight = entry.in_flight.len(), "nonce allocated");
        Ok(candidate)
    }

    /// Record the transaction a reserved nonce was spent on
    pub async fn bind(&self, signer: Address, nonce: u64, tx_hash: TxHash) {
        let mut signers = self.signers.lock().await;
        if let Some(slot) = signers
            .get_mut(&signer)
            .and_then(|s| s.in_flight.get_mut(&nonce))
        {
            slot.tx_hash = Some(tx_hash);
        }
    }

    /// Release a nonce whose transaction was mined or given up on
    pub async fn release(&self, signer: Address, nonce: u64) -> bool {
        let mut signers = self.signers.lock().await;
        signers
            .get_mut(&signer)
            .is_some_and(|s| s.in_flight.remove(&nonce).is_some())
    }

    /// Release a nonce that never reached the network.
    ///
    /// Later nonces may already be out, so the counter is rewound: the next
    /// allocation re-seeds from the pending count and fills the gap.
    pub async fn release_unused(&self, signer: Address, nonce: u64) {
        let mut signers = self.signers.lock().await;
        if let Some(entry) = signers.get_mut(&signer) {
            entry.in_flight.remove(&nonce);
            entry.next = None;
        }
    }

    /// Release whichever nonce was bound to `tx_hash`
    pub async fn release_by_hash(&self, signer: Address, tx_hash: TxHash) -> Option<u64> {
        let mut signers = self.signers.lock().await;
        let entry = signers.get_mut(&signer)?;
        let nonce = entry
            .in_flight
            .iter()
            .find(|(_, slot)| slot.tx_hash == Some(tx_hash))
            .map(|(nonce, _)| *nonce)?;
        entry.in_flight.remove(&nonce);
        Some(nonce)
    }

    /// Whether some reserved nonce is still bound to `tx_hash`
    pub async fn holds_hash(&self, signer: Address, tx_hash: TxHash) -> bool {
        let signers = self.signers.lock().await;
        signers.get(&signer).is_some_and(|entry| {
            entry
                .in_flight
                .values()
                .any(|slot| slot.tx_hash == Some(tx_hash))
        })
    }

    /// The network rejected `stale` as already used: drop it, move past it and
    /// whatever the network now reports, and hand out a fresh nonce.
    pub async fn reallocate_after_conflict(&self, signer: Address, stale: u64) -> ChainResult<u64> {
        let mut signers = self.signers.lock().await;
        let entry = signers.entry(signer).or_default();
        entry.in_flight.remove(&stale);

        let network = match self.seed(signer).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%signer, error = %e, "⚠️ Nonce resync failed, stepping past the stale nonce");
                0
            }
        };
        let mut candidate = network.max(stale + 1);
        while entry.in_flight.contains_key(&candidate) {
            candidate += 1;
        }

        entry.in_flight.insert(
            candidate,
            InFlight {
                tx_hash: None,
                since: Instant::now(),
            },
        );
        entry.next = Some(candidate + 1);

        info!(%signer, stale, nonce = candidate, "🔄 Nonce reallocated after conflict");
        Ok(candidate)
    }

    /// Administrator abandonment of one nonce
    pub async fn abandon(&self, signer: Address, nonce: u64) -> bool {
        let released = self.release(signer, nonce).await;
        if released {
            warn!(%signer, nonce, "⚠️ Nonce abandoned by administrator");
        }
        released
    }

    /// Administrator abandonment of every nonce reserved for at least `age`
    pub async fn abandon_older_than(&self, signer: Address, age: Duration) -> Vec<u64> {
        let mut signers = self.signers.lock().await;
        let Some(entry) = signers.get_mut(&signer) else {
            return Vec::new();
        };

        let stale: Vec<u64> = entry
            .in_flight
            .iter()
            .filter(|(_, slot)| slot.since.elapsed() >= age)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in &stale {
            entry.in_flight.remove(nonce);
        }

        if !stale.is_empty() {
            warn!(%signer, nonces = ?stale, "⚠️ Abandoned nonces past cooling-off period");
        }
        stale
    }

    pub async fn in_flight(&self, signer: Address) -> Vec<InFlightNonce> {
        let signers = self.signers.lock().await;
        signers
            .get(&signer)
            .map(|entry| {
                entry
                    .in_flight
                    .iter()
                    .map(|(nonce, slot)| InFlightNonce {
                        nonce: *nonce,
                        tx_hash: slot.tx_hash.map(|h| h.to_string()),
                        age_secs: slot.since.elapsed().as_secs(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending count, falling back to a direct latest-block query
    async fn seed(&self, signer: Address) -> ChainResult<u64> {
        match self.chain.pending_nonce(signer).await {
            Ok(nonce) => {
                info!(%signer, nonce, block_tag = "pending", "Nonce seeded");
                Ok(nonce)
            }
            Err(e) => {
                warn!(
                    %signer,
                    error = %e,
                    "⚠️ Pending nonce query failed, falling back to latest"
                );
                let nonce = self.chain.latest_nonce(signer).await?;
                warn!(%signer, nonce, block_tag = "latest", "Nonce seeded from latest block");
                Ok(nonce)
            }
        }
    }
}
