//! The replenisher (C9, §4.9): an independent sub-flow that tops up the
//! payout multisig from a separate multisig under its own rate limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bitcoin::BitcoinAdapter;
use crate::config::ReplenisherConfig;
use crate::domain::transfer::Transfer;
use crate::error::{Error, Result};
use crate::monitoring::{names, Metrics};

/// In-memory rate-limit window: `max_per_period` replenishments per `period`.
/// Not persisted — a restart resets the window, which only ever makes the
/// limiter *more* permissive, never less, so it cannot cause a stuck state.
struct RateLimiter {
    period: Duration,
    max_per_period: u32,
    window_start: Instant,
    count_in_window: u32,
    periods_elapsed: u64,
}

impl RateLimiter {
    fn new(period: Duration, max_per_period: u32) -> Self {
        Self {
            period,
            max_per_period,
            window_start: Instant::now(),
            count_in_window: 0,
            periods_elapsed: 0,
        }
    }

    fn try_consume(&mut self) -> bool {
        if self.window_start.elapsed() >= self.period {
            self.window_start = Instant::now();
            self.count_in_window = 0;
            self.periods_elapsed += 1;
        }
        if self.count_in_window >= self.max_per_period {
            return false;
        }
        self.count_in_window += 1;
        true
    }
}

struct AlertCooldown {
    cooldown: Duration,
    last_alert: Option<Instant>,
}

impl AlertCooldown {
    fn should_alert(&mut self) -> bool {
        let ready = match self.last_alert {
            None => true,
            Some(last) => last.elapsed() >= self.cooldown,
        };
        if ready {
            self.last_alert = Some(Instant::now());
        }
        ready
    }
}

pub struct Replenisher {
    payout_bitcoin: Arc<dyn BitcoinAdapter>,
    replenisher_bitcoin: Arc<dyn BitcoinAdapter>,
    config: ReplenisherConfig,
    rate_limiter: Mutex<RateLimiter>,
    alert_cooldown: Mutex<AlertCooldown>,
    metrics: Arc<Metrics>,
}

impl Replenisher {
    pub fn new(
        payout_bitcoin: Arc<dyn BitcoinAdapter>,
        replenisher_bitcoin: Arc<dyn BitcoinAdapter>,
        config: ReplenisherConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.period, config.max_per_period);
        let alert_cooldown = AlertCooldown {
            cooldown: config.alert_cooldown,
            last_alert: None,
        };
        Self {
            payout_bitcoin,
            replenisher_bitcoin,
            config,
            rate_limiter: Mutex::new(rate_limiter),
            alert_cooldown: Mutex::new(alert_cooldown),
            metrics,
        }
    }

    /// Runs once per node-loop iteration (§4.9). `None` means no action was
    /// needed or the rate limit blocked the attempt; `Some(psbt)` is an
    /// unsigned, self-signed no-change replenishment PSBT ready for peer
    /// signature gathering.
    pub async fn run_once(&self) -> Result<Option<bitcoin::psbt::Psbt>> {
        self.check_alert_threshold().await?;

        let payout_balance = self.payout_bitcoin.multisig_balance(false).await?;
        if payout_balance.to_sat() >= self.config.replenish_threshold_sat {
            return Ok(None);
        }

        if !self.rate_limiter.lock().try_consume() {
            tracing::warn!(
                max_per_period = self.config.max_per_period,
                "replenishment rate limit reached; skipping this iteration"
            );
            return Ok(None);
        }

        let deficit = self.config.replenish_threshold_sat.saturating_sub(payout_balance.to_sat());
        let amount = deficit.clamp(self.config.min_amount_sat, self.config.max_amount_sat);

        let payout_address = self.payout_bitcoin.canonical_address().address.to_string();
        let transfer = Transfer::new(payout_address, 0, amount, "replenisher".to_string(), ethers::types::H256::zero(), 0, 0)?;

        let psbt = self
            .replenisher_bitcoin
            .create_partial_tx(&[transfer], true, true, None)
            .await?;

        self.metrics.incr(names::REPLENISHMENTS_THIS_PERIOD);
        Ok(Some(psbt))
    }

    /// Whether `psbt`'s transaction has already been broadcast and seen by
    /// the node, so a restarted signature round doesn't double-spend (§4.9, §5).
    pub async fn already_broadcast(&self, psbt: &bitcoin::psbt::Psbt) -> Result<bool> {
        let txid = psbt.unsigned_tx.compute_txid();
        Ok(self.replenisher_bitcoin.get_tx(&txid).await?.is_some())
    }

    /// Add a peer's signature contribution to the running replenishment PSBT,
    /// mirroring the main batch's Bitcoin signature flow (§4.5, §4.9).
    pub fn combine(&self, psbts: &[bitcoin::psbt::Psbt]) -> Result<bitcoin::psbt::Psbt> {
        self.replenisher_bitcoin.combine(psbts)
    }

    /// Sign `psbt` with this node's replenisher key, used both by the
    /// initiator's own contribution and by peers answering a
    /// `RequestReplenishSignature` (§4.9).
    pub async fn sign_contribution(&self, psbt: &bitcoin::psbt::Psbt) -> Result<bitcoin::psbt::Psbt> {
        self.replenisher_bitcoin.sign(psbt).await
    }

    /// Every input must carry at least `required` partial signatures before
    /// the PSBT can be finalized and broadcast (§4.9).
    pub fn has_enough_signatures(&self, psbt: &bitcoin::psbt::Psbt, required: usize) -> bool {
        !psbt.inputs.is_empty() && psbt.inputs.iter().all(|i| i.partial_sigs.len() >= required)
    }

    /// Validate then broadcast a fully-signed replenishment PSBT (§4.9).
    pub async fn submit(&self, psbt: &bitcoin::psbt::Psbt) -> Result<bitcoin::Txid> {
        self.validate_replenishment_psbt(psbt)?;
        self.replenisher_bitcoin.submit(psbt).await
    }

    /// How many rate-limit periods have elapsed and how many replenishments
    /// have been consumed in the current one, echoed into
    /// `RequestReplenishSignature` so peers can audit the initiator's pacing (§4.9).
    pub fn rate_limit_progress(&self) -> (u64, u32) {
        let limiter = self.rate_limiter.lock();
        (limiter.periods_elapsed, limiter.count_in_window)
    }

    /// Validate a PSBT built by [`Self::run_once`]: second output must be the
    /// payout multisig; an optional third output must be the replenisher's
    /// own change (§4.9).
    pub fn validate_replenishment_psbt(&self, psbt: &bitcoin::psbt::Psbt) -> Result<()> {
        let outputs = &psbt.unsigned_tx.output;
        if outputs.len() < 2 {
            return Err(Error::validation("replenishment psbt must have at least an OP_RETURN and a payout output"));
        }
        if outputs[1].script_pubkey != self.payout_bitcoin.canonical_address().address.script_pubkey() {
            return Err(Error::validation("replenishment psbt's second output does not pay the payout multisig"));
        }
        if outputs.len() > 2 && outputs[2].script_pubkey != self.replenisher_bitcoin.canonical_address().address.script_pubkey() {
            return Err(Error::validation("replenishment psbt's change output does not pay the replenisher multisig"));
        }
        Ok(())
    }

    /// Raise an alert, at most once per cooldown window, if the combined
    /// (payout + replenisher) balance has fallen below the alert threshold (§4.9).
    async fn check_alert_threshold(&self) -> Result<()> {
        let payout_balance = self.payout_bitcoin.multisig_balance(false).await?;
        let replenisher_balance = self.replenisher_bitcoin.multisig_balance(false).await?;
        let combined = payout_balance.to_sat() + replenisher_balance.to_sat();
        if combined < self.config.alert_threshold_sat && self.alert_cooldown.lock().should_alert() {
            tracing::error!(combined_balance_sat = combined, threshold_sat = self.config.alert_threshold_sat, "combined multisig balance below alert threshold");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_blocks_after_max_per_period() {
        let mut limiter = RateLimiter::new(Duration::from_secs(3600), 3);
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[test]
    fn rate_limiter_resets_after_period_elapses() {
        let mut limiter = RateLimiter::new(Duration::from_millis(1), 1);
        assert!(limiter.try_consume());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_consume());
    }

    #[test]
    fn alert_cooldown_fires_once_then_waits() {
        let mut cooldown = AlertCooldown { cooldown: Duration::from_secs(3600), last_alert: None };
        assert!(cooldown.should_alert());
        assert!(!cooldown.should_alert());
    }
}
