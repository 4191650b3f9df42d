//! Single-slot rendezvous between a waiting request and one asynchronous reply.
//!
//! A [`Completer`] travels with the asynchronous request into the client
//! library and is consumed by the completion callback; the matching
//! [`Completion`] stays with the request thread, which polls it from the
//! service loop. Neither half can be shared with another request.

use super::backend::FsResult;
use libc::EIO;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};

/// Sending half, handed to the completion callback.
#[derive(Debug)]
pub struct Completer<T> {
    tx: SyncSender<FsResult<T>>,
}

/// Receiving half, polled by the service loop driver.
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<FsResult<T>>,
}

/// Creates a fresh completion cell for exactly one request.
pub fn pair<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = sync_channel(1);
    (Completer { tx }, Completion { rx })
}

impl<T> Completer<T> {
    /// Stores the result and marks the cell finished.
    pub fn complete(self, result: FsResult<T>) {
        // The slot holds one value and this completer is consumed, so the
        // send can only fail when the waiter is already gone.
        let _ = self.tx.try_send(result);
    }

    /// Convenience for callbacks that report a status code.
    pub fn complete_status(self, status: i32, value: impl FnOnce() -> T) {
        if status < 0 {
            self.complete(Err(-status));
        } else {
            self.complete(Ok(value()));
        }
    }
}

impl<T> Completion<T> {
    /// Takes the result if the callback has run.
    ///
    /// A completer that was dropped without completing (the client tore
    /// the request down) resolves to `EIO`.
    pub fn try_take(&self) -> Option<FsResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EIO)),
        }
    }
}
