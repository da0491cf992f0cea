use std::future::Future;

/// Helper function to run async property tests against a fresh
/// in-memory store. Panics are treated as test failures.
pub fn test_prop<F, Fut>(f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    rt.block_on(async {
        f().await;
    });
}
