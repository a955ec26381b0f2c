use chokepoint::ChokePoint;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn counted(
    calls: &Arc<AtomicUsize>,
    value: u32,
) -> impl Future<Output = Result<u32, String>> + Send + 'static {
    let calls = Arc::clone(calls);
    async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(value)
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_share_one_computation() {
    let choke: ChokePoint<&'static str, u32, String> = ChokePoint::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
        choke.run("roster", counted(&calls, 1)),
        choke.run("roster", counted(&calls, 2)),
    );

    assert_eq!(a, Ok(1));
    assert_eq!(b, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_keys_run_independently() {
    let choke: ChokePoint<&'static str, u32, String> = ChokePoint::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
        choke.run("roster", counted(&calls, 1)),
        choke.run("routines", counted(&calls, 2)),
    );

    assert_eq!(a, Ok(1));
    assert_eq!(b, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_key_released_after_completion() {
    let choke: ChokePoint<&'static str, u32, String> = ChokePoint::new();
    let calls = Arc::new(AtomicUsize::new(0));

    assert_eq!(choke.run("roster", counted(&calls, 1)).await, Ok(1));
    assert!(!choke.is_in_flight(&"roster"));
    assert_eq!(choke.run("roster", counted(&calls, 2)).await, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_key_released_after_failure() {
    let choke: ChokePoint<&'static str, u32, String> = ChokePoint::new();

    let failed = choke
        .run("roster", async { Err::<u32, _>("offline".to_string()) })
        .await;
    assert_eq!(failed, Err("offline".to_string()));
    assert!(!choke.is_in_flight(&"roster"));

    let ok = choke.run("roster", async { Ok::<_, String>(7) }).await;
    assert_eq!(ok, Ok(7));
}

#[tokio::test(start_paused = true)]
async fn test_key_released_when_every_waiter_is_dropped() {
    let choke: ChokePoint<&'static str, u32, String> = ChokePoint::new();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        choke.run("roster", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(1)
        }),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(!choke.is_in_flight(&"roster"));

    let ok = choke.run("roster", async { Ok::<_, String>(2) }).await;
    assert_eq!(ok, Ok(2));
}
