// SPDX-License-Identifier: MPL-2.0

//! Conflated render requests: any number of requests collapse into one.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Producer side. Cheap to clone and safe to call from any thread.
#[derive(Debug, Clone)]
pub struct RenderRequester {
    tx: Sender<()>,
}

impl RenderRequester {
    /// Ask for one render. Never blocks; a request already pending absorbs this one.
    ///
    /// Returns `false` only when the render loop is gone.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

/// Consumer side, owned by the render thread.
#[derive(Debug)]
pub struct RenderSignal {
    rx: Receiver<()>,
}

/// Single slot channel: at most one pending request is ever retained.
pub fn render_signal() -> (RenderRequester, RenderSignal) {
    let (tx, rx) = bounded(1);
    (RenderRequester { tx }, RenderSignal { rx })
}

impl RenderSignal {
    /// Block until a request is pending. `false` once every requester is dropped.
    pub fn wait(&self) -> bool {
        self.rx.recv().is_ok()
    }

    /// Consume a pending request without blocking.
    #[cfg(test)]
    pub fn take_pending(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
