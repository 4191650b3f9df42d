//! Service-loop driver.
//!
//! Network clients multiplex every request over one socket and only make
//! progress when their event-processing step is called. The driver turns
//! that into a blocking call: it polls the client's socket for the events
//! the client wants, hands the observed readiness back to the client and
//! repeats until the request's [`Completion`] has a result.

use super::backend::FsResult;
use super::completion::{self, Completer, Completion};
use super::constants::POLL_INTERVAL_MS;
use libc::{c_int, EIO};
use log::{trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::RawFd;

/// The event source of an asynchronous client library.
pub trait EventLoop {
    /// Socket the client is currently using.
    fn fd(&self) -> RawFd;

    /// Events the client wants to be woken for.
    fn which_events(&self) -> PollFlags;

    /// Runs the client's state machine for the observed readiness.
    ///
    /// `None` means the poll itself failed. An error is a protocol level
    /// failure of the connection.
    fn service(&mut self, revents: Option<PollFlags>) -> Result<(), c_int>;
}

/// Blocks until `completion` has a result, pumping `client` meanwhile.
pub fn await_completion<C, T>(client: &mut C, completion: Completion<T>) -> FsResult<T>
where
    C: EventLoop + ?Sized,
{
    loop {
        if let Some(result) = completion.try_take() {
            return result;
        }

        let mut fds = [PollFd::new(client.fd(), client.which_events())];
        let revents = match poll(&mut fds, POLL_INTERVAL_MS) {
            Ok(_) => Some(fds[0].revents().unwrap_or_else(PollFlags::empty)),
            Err(err) => {
                trace!("poll on client socket failed: {}", err);
                None
            }
        };

        if let Err(err) = client.service(revents) {
            warn!("service loop failed ({}), failing pending request", err);
            return Err(EIO);
        }
    }
}

/// Issues one asynchronous request and waits for its reply.
///
/// A request the client rejects synchronously returns that error at once
/// and never enters the service loop.
pub fn issue_and_wait<C, T, F>(client: &mut C, issue: F) -> FsResult<T>
where
    C: EventLoop + ?Sized,
    F: FnOnce(&mut C, Completer<T>) -> FsResult<()>,
{
    let (done, pending) = completion::pair();
    issue(client, done)?;
    await_completion(client, pending)
}
