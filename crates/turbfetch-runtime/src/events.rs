use tokio::sync::watch;
use turbfetch_core::types::ChunkRange;

/// Notifications out of the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SpatialProgress { done: u64, total: u64 },
    TemporalProgress { done: u32, total: u32 },
    ChunkSaved { range: ChunkRange },
    SnapshotComplete { temporal_index: u32 },
    SeriesComplete,
    Status(String),
    Error(String),
}

/// Requested run state; the loop observes it, it never writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Running,
    Paused,
    Stopped,
}

/// Control surface handed to the caller of a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: watch::Sender<Control>,
}

impl SessionHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<Control>) {
        let (tx, rx) = watch::channel(Control::Running);
        (Self { tx }, rx)
    }

    /// No effect once stopped.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|c| {
            if *c == Control::Running {
                *c = Control::Paused;
                true
            } else {
                false
            }
        })
    }

    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|c| {
            if *c == Control::Paused {
                *c = Control::Running;
                true
            } else {
                false
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|c| {
            if *c == Control::Stopped {
                false
            } else {
                *c = Control::Stopped;
                true
            }
        })
    }

    pub fn control(&self) -> Control {
        *self.tx.borrow()
    }
}

/// Resolves once a stop is requested. Never resolves if every handle is gone.
pub(crate) async fn stopped(mut rx: watch::Receiver<Control>) {
    if rx.wait_for(|c| *c == Control::Stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
