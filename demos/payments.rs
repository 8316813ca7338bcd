//! Simulates concurrent payment webhooks against one payment and a stream of
//! per-organization request logs.
//!
//! Run with `RUST_LOG=keylane=debug cargo run --example payments`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use keylane::{GroupedThrottledQueue, HandlerError, KeyedQueue, ThrottleConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("payment {0} was already settled")]
struct AlreadySettled(u32);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let queue = KeyedQueue::new();
    let settlements = Arc::new(AtomicU32::new(0));

    // Five webhook deliveries race to settle payment 42. Serialized on the
    // payment key, only the first one observes it as unsettled.
    let deliveries: Vec<_> = (0..5)
        .map(|attempt| {
            let settlements = Arc::clone(&settlements);
            queue.schedule("payments/42", move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if settlements.load(Ordering::SeqCst) > 0 {
                    return Err(AlreadySettled(42));
                }
                settlements.fetch_add(1, Ordering::SeqCst);
                Ok(attempt)
            })
        })
        .collect();

    for delivery in deliveries {
        match delivery.await {
            Ok(attempt) => info!(attempt, "payment settled"),
            Err(e) => info!(error = %e, "delivery skipped"),
        }
    }

    // A burst of status checks collapses into one.
    let checks: Vec<_> = (0..3)
        .map(|n| {
            queue.debounce(
                "payment-status/42",
                move || async move { Ok::<_, AlreadySettled>(n) },
                Duration::from_millis(100),
            )
        })
        .collect();
    for check in checks {
        match check.await {
            Ok(n) => info!(check = n, "status checked"),
            Err(e) if e.is_debounced() => info!("status check superseded"),
            Err(e) => return Err(e.into()),
        }
    }

    let request_log = GroupedThrottledQueue::with_config(
        |organization: String, lines: Vec<String>| async move {
            info!(organization = %organization, lines = lines.len(), "request log batch");
            Ok::<(), HandlerError>(())
        },
        ThrottleConfig::from_env()?.with_max_delay(Duration::from_millis(250)),
    );
    for n in 0..250 {
        request_log.add_item(format!("org-{}", n % 3), format!("GET /members/{n} 4ms"));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    request_log.wait().await;

    queue.abort_all("demo finished");
    queue.await_all().await;
    Ok(())
}
