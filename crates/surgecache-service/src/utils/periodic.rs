use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs `job` every `interval` until `token` is cancelled.
///
/// The first run happens immediately. A run that takes longer than `interval` delays the
/// following runs instead of making them pile up, and a run in progress is abandoned on
/// cancellation.
pub async fn every<F, Fut>(interval: Duration, token: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = job() => {}
        }
    }
}
