use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::ContainerEvent;
use crate::rebalance::ListenerShared;

/// Watches the poll loop from outside. If no poll happened for
/// `poll_timeout * no_poll_threshold`, publishes a `NonResponsive` event so
/// operators can tell a stuck handler from an idle topic.
///
/// Runs on its own scheduler thread; the container unparks it on stop so
/// shutdown is not delayed by the monitor interval.
pub(crate) fn spawn_monitor(
    shared: Arc<ListenerShared>,
    shutdown: CancellationToken,
) -> std::io::Result<thread::JoinHandle<()>> {
    let interval = shared.config.monitor_interval;
    let threshold = scale(shared.config.poll_timeout, shared.config.no_poll_threshold);

    thread::Builder::new()
        .name(format!("{}-monitor", shared.container_id))
        .spawn(move || {
            debug!(container_id = %shared.container_id, ?interval, "liveness monitor started");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let since_last_poll = {
                    let last_poll = shared.last_poll.lock().expect("last poll mutex poisoned");
                    last_poll.elapsed()
                };
                let responsive = since_last_poll <= threshold;
                if let Some(liveness) = &shared.liveness {
                    liveness(responsive);
                }
                if !responsive {
                    shared.events.publish(
                        &shared.container_id,
                        ContainerEvent::NonResponsive { since_last_poll },
                    );
                }
                thread::park_timeout(interval);
            }
            info!(container_id = %shared.container_id, "liveness monitor stopped");
        })
}

fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(duration.as_secs_f64() * factor.max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_scales_and_clamps() {
        assert_eq!(
            scale(Duration::from_secs(5), 3.0),
            Duration::from_secs(15)
        );
        // a sub-1 factor would flag healthy consumers; clamp it
        assert_eq!(scale(Duration::from_secs(5), 0.1), Duration::from_secs(5));
    }
}
