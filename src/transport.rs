//! Behaviour shared by every byte transport
//!
//! TCP clients, accepted TCP connections, UDP clients, UDP peers and their
//! secure counterparts all implement [`Transport`]. Concrete types provide the
//! raw `send_bytes` primitive; the typed `send_data` helpers are written once
//! here.

use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::removable::Removable;

/// Completion callback receiving only the outcome
pub type SendCompletion = Box<dyn FnOnce(Result<(), Error>)>;

pub trait Transport: Removable + Clone + 'static {
    /// Queues `data` for sending; `cb` runs exactly once on the loop thread
    fn send_bytes(&self, data: Bytes, cb: SendCompletion);

    fn is_open(&self) -> bool;

    /// Remote side of the transport, `Undefined` when not known yet
    fn endpoint(&self) -> Endpoint;

    fn event_loop(&self) -> &EventLoop;

    /// Sends `data`; `cb` receives the transport and the outcome
    fn send_data<D, F>(&self, data: D, cb: F)
    where
        D: Into<Bytes>,
        F: FnOnce(&Self, Result<(), Error>) + 'static,
    {
        let this = self.clone();
        self.send_bytes(data.into(), Box::new(move |result| cb(&this, result)));
    }

    /// Sends `data` and only logs a failure
    fn send(&self, data: impl Into<Bytes>) {
        let endpoint = self.endpoint();
        self.send_bytes(
            data.into(),
            Box::new(move |result| {
                if let Err(e) = result {
                    log::debug!("send to {} failed: {}", endpoint, e);
                }
            }),
        );
    }
}

/// Delivers `result` to `cb` on the next loop iteration
pub(crate) fn complete_later(lp: &EventLoop, cb: SendCompletion, result: Result<(), Error>) {
    lp.post(move |_| cb(result));
}
