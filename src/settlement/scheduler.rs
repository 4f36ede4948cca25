// Settlement Scheduler - runs a settlement cycle on a fixed interval
//
// A cycle that overruns the interval is not doubled up: the next tick finds
// the engine busy and skips. Missed ticks are delayed, not burst.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use super::processor::SettlementEngine;
use crate::error::{AppError, SettlementError};

pub struct SettlementScheduler {
    engine: Arc<SettlementEngine>,
    period: Duration,
}

impl SettlementScheduler {
    pub fn new(engine: Arc<SettlementEngine>, period: Duration) -> Self {
        Self { engine, period }
    }

    /// Start the settlement scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let period = self.period;

        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "⏰ Settlement scheduler started");

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                Self::tick(&engine).await;
            }
        })
    }

    async fn tick(engine: &SettlementEngine) {
        match engine.run_cycle(false).await {
            Ok(summary) => {
                if let Some(reason) = &summary.error {
                    warn!(
                        processed = summary.processed_count,
                        error = %reason,
                        "⚠️ Settlement cycle finished with errors"
                    );
                }
            }
            Err(AppError::Settlement(SettlementError::CycleInProgress)) => {
                info!("⏭️ Previous settlement cycle still running, skipping tick");
            }
            Err(e) => error!("❌ Settlement cycle failed: {:?}", e),
        }
    }
}
