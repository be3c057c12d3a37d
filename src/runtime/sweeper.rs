//! Periodic timeout sweep
//!
//! Each site runs one sweep task on a fixed interval. Active contexts older
//! than the configured timeout are abandoned and their pending replies
//! dropped. The task holds only a weak site handle and ends with the site.

use tokio::time::{Instant, MissedTickBehavior};

use super::site::Site;

/// Spawn the sweep task for `site` if a tokio runtime is available.
pub(crate) fn spawn(site: &Site) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak = site.downgrade();
    let period = site.runtime().sweep_interval;
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(site) = weak.upgrade() else {
                break;
            };
            site.sweep_timeouts();
        }
    });
}

impl Site {
    /// Abandon every active context running longer than the timeout.
    /// Returns how many were reaped.
    pub fn sweep_timeouts(&self) -> usize {
        let expired = self.take_expired();
        for ctx in &expired {
            self.expire(ctx);
        }
        expired.len()
    }
}
