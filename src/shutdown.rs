use tokio::sync::watch;

/// Signals that the host is shutting down.
///
/// A cancellation observed while the signal is raised means "the host is
/// recycling, not a processing failure": the in-flight message must skip the
/// error pipeline and be left for redelivery after restart.
#[derive(Debug)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

/// Read side of a [`ShutdownSignal`]. Cheap to clone, one per in-flight
/// message-processing invocation.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

/// Create a connected signal/token pair.
pub fn shutdown_channel() -> (ShutdownSignal, ShutdownToken) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownSignal { sender }, ShutdownToken { receiver })
}

impl ShutdownSignal {
    /// Raise the shutdown signal. All tokens observe it immediately.
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }
}

impl ShutdownToken {
    /// Whether the host has requested shutdown.
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// A token that never signals shutdown. Useful for hosts without a
    /// cooperative shutdown hook.
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }
}
