//! Single-threaded apartment message queue
//!
//! Inbound calls for an STA are posted to its inbox as boxed jobs. Whoever
//! is pumping the apartment runs them one at a time: either
//! [`Apartment::run_message_loop`], or an outbound call from the apartment
//! waiting for its reply in [`Apartment::pump_until`]. The latter is what
//! lets a callee call back into the caller's apartment without deadlocking.
//!
//! A quit request seen while waiting on an outbound call is not acted on;
//! it is moved to a redelivery queue that the message loop drains, in order,
//! before looking at the inbox again.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use parking_lot::Mutex;
use rpcrt::{Job, RpcError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use super::Apartment;
use crate::types::{ComError, Result};

/// Message posted to an apartment
pub enum ApartmentMessage {
    /// Run a job in the apartment
    Call(Job),
    /// Ask the message loop to return
    Quit,
}

impl std::fmt::Debug for ApartmentMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApartmentMessage::Call(_) => f.write_str("Call"),
            ApartmentMessage::Quit => f.write_str("Quit"),
        }
    }
}

pub(crate) struct Inbox {
    tx: mpsc::UnboundedSender<ApartmentMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ApartmentMessage>>,
    redeliver: Mutex<VecDeque<ApartmentMessage>>,
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            redeliver: Mutex::new(VecDeque::new()),
        }
    }

    async fn recv(&self) -> Option<ApartmentMessage> {
        self.rx.lock().await.recv().await
    }
}

/// Run a job, turning a panic into a logged no-op
async fn run_job(job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("apartment job panicked");
    }
}

impl Apartment {
    /// Queue a message. On an MTA calls are spawned straight away and quit
    /// requests are ignored.
    pub fn post(&self, msg: ApartmentMessage) -> Result<()> {
        if !self.is_sta() {
            if let ApartmentMessage::Call(job) = msg {
                tokio::spawn(run_job(job));
            }
            return Ok(());
        }
        self.inbox
            .tx
            .send(msg)
            .map_err(|_| ComError::NotInitialized)
    }

    pub fn post_quit(&self) {
        let _ = self.post(ApartmentMessage::Quit);
    }

    /// Messages waiting for redelivery
    pub fn deferred_messages(&self) -> usize {
        self.inbox.redeliver.lock().len()
    }

    /// Run posted calls until a quit request arrives. Returns the number of
    /// calls run.
    pub async fn run_message_loop(&self) -> usize {
        let mut calls = 0;
        loop {
            let redelivered = self.inbox.redeliver.lock().pop_front();
            let msg = match redelivered {
                Some(msg) => {
                    debug!(oxid = %self.oxid(), ?msg, "redelivering deferred message");
                    Some(msg)
                }
                None => self.inbox.recv().await,
            };
            match msg {
                Some(ApartmentMessage::Call(job)) => {
                    run_job(job).await;
                    calls += 1;
                }
                Some(ApartmentMessage::Quit) | None => {
                    trace!(oxid = %self.oxid(), calls, "message loop exiting");
                    return calls;
                }
            }
        }
    }

    /// Wait for `done` while running calls posted to this apartment
    pub(crate) async fn pump_until<T>(&self, mut done: oneshot::Receiver<T>) -> Result<T> {
        let mut deferred = Vec::new();
        let result = loop {
            let msg = tokio::select! {
                biased;
                result = &mut done => break result,
                msg = self.inbox.recv() => msg,
            };
            match msg {
                Some(ApartmentMessage::Call(job)) => run_job(job).await,
                Some(ApartmentMessage::Quit) => {
                    debug!(oxid = %self.oxid(), "deferring quit until the outstanding call completes");
                    deferred.push(ApartmentMessage::Quit);
                }
                None => break (&mut done).await,
            }
        };

        if !deferred.is_empty() {
            self.inbox.redeliver.lock().extend(deferred);
        }
        result.map_err(|_| ComError::Rpc(RpcError::CallFailed))
    }
}
