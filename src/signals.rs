use tokio::io;

/// Resolves with the name of the first termination signal received.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let signal = tokio::select! {
        _ = hangup.recv() => "hangup",
        _ = interrupt.recv() => "interrupt",
        _ = quit.recv() => "quit",
        _ = terminate.recv() => "terminate",
    };

    Ok(signal)
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;

    Ok("ctrl-c")
}
