//! Leader-gate helpers for singleton background loops.
//!
//! Each loop calls `confirm_leader` before doing work. Holders re-confirm
//! cheaply; non-holders sit idle and retry with jitter so replicas don't
//! stampede the lock when the holder dies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use smelter_core::ports::LeaderGate;

/// Check (or acquire) leadership for a component, logging transitions.
pub async fn confirm_leader(gate: &Arc<dyn LeaderGate>, component: &str) -> bool {
    match gate.try_lead(component).await {
        Ok(leading) => leading,
        Err(e) => {
            tracing::warn!(component, error = %e, "leader check failed");
            false
        }
    }
}

/// Base interval plus up to 50% random jitter.
pub fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_base() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d <= base + Duration::from_secs(15));
        }
    }
}
