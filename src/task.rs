use std::future::Future;

use tokio::task::JoinHandle;

/// Spawn onto the current runtime, naming the task when tokio-console is on.
pub fn spawn<F>(name: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    #[cfg(feature = "tokio-console")]
    let handle = tokio::task::Builder::new()
        .name(name)
        .spawn(future)
        .expect("tasks are only spawned from within the runtime");

    #[cfg(not(feature = "tokio-console"))]
    let handle = {
        let _ = name;
        tokio::task::spawn(future)
    };

    handle
}
