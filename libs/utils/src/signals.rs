use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

/// Resolve once the process receives SIGINT or SIGTERM.
///
/// Intended to be raced against the serving future in the binary entry
/// point; the caller decides what an orderly shutdown looks like.
pub async fn wait_for_shutdown() -> anyhow::Result<Signal> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok(Signal::Interrupt),
        _ = sigterm.recv() => Ok(Signal::Terminate),
    }
}
