//! Holding flows for inspection.
//!
//! A matching flow is handed to the controller over a channel together with a
//! one-shot reply slot. The protocol worker waits for the reply, then forwards
//! or aborts depending on the state the flow comes back in.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::filter::Filter;
use crate::flow::HTTPFlow;
use crate::{Error, Result};

const QUEUE_SIZE: usize = 64;

/// An intercepted flow waiting for a verdict.
#[derive(Debug)]
pub struct PendingFlow {
    pub flow: HTTPFlow,
    reply: oneshot::Sender<HTTPFlow>,
}

impl PendingFlow {
    pub fn id(&self) -> &str {
        self.flow.id()
    }

    /// Forward the flow, including any changes made to it.
    pub fn resume(mut self) {
        self.flow.resume();
        if self.reply.send(self.flow).is_err() {
            debug!("intercepted flow was abandoned before resume");
        }
    }

    /// Abort the flow.
    pub fn kill(mut self) {
        if let Err(e) = self.flow.kill() {
            warn!(error = %e, "kill on a flow that is not intercepted");
        }
        if self.reply.send(self.flow).is_err() {
            debug!("intercepted flow was abandoned before kill");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Interceptor {
    filter: Option<Filter>,
    tx: Option<mpsc::Sender<PendingFlow>>,
    timeout: Option<Duration>,
}

impl Interceptor {
    /// Interceptor that holds flows matching `filter`, and the controller side
    /// receiving them.
    pub fn new(filter: Filter, timeout: Option<Duration>) -> (Self, mpsc::Receiver<PendingFlow>) {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let interceptor = Self {
            filter: Some(filter),
            tx: Some(tx),
            timeout,
        };
        (interceptor, rx)
    }

    /// Interceptor that never holds anything.
    pub fn disabled() -> Self {
        Self {
            filter: None,
            tx: None,
            timeout: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.filter.is_some()
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Hold `flow` if it matches and wait for the verdict.
    ///
    /// Returns `Err(Error::Killed)` when the flow was killed, explicitly or by
    /// timing out. The flow then carries the kill error.
    pub async fn intercept(&self, flow: &mut HTTPFlow) -> Result<()> {
        let (Some(filter), Some(tx)) = (&self.filter, &self.tx) else {
            return Ok(());
        };
        if !filter.matches(&*flow) {
            return Ok(());
        }

        flow.intercept();
        flow.backup(false);
        info!(flow = %flow.id(), url = %flow.request.url(), "intercepted");

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingFlow {
            flow: flow.clone(),
            reply: reply_tx,
        };
        if tx.send(pending).await.is_err() {
            debug!(flow = %flow.id(), "no intercept controller, resuming");
            flow.resume();
            return Ok(());
        }

        let verdict = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply.ok(),
                Err(_) => {
                    warn!(flow = %flow.id(), timeout = ?limit, "intercept timed out, killing flow");
                    None
                }
            },
            None => reply_rx.await.ok(),
        };

        match verdict {
            Some(updated) => *flow = updated,
            None => {
                flow.kill()?;
            }
        }

        if flow.flow.is_killed() {
            debug!(flow = %flow.id(), "killed while intercepted");
            return Err(Error::Killed);
        }
        if flow.flow.is_intercepted() {
            // Controller replied without deciding.
            flow.resume();
        }
        Ok(())
    }
}
