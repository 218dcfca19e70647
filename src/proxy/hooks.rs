//! Event hooks exposed to addons.
//!
//! Each hook receives the flow by mutable reference and may change it before
//! the protocol layer continues. Setting `flow.response` from `request`
//! answers the client without contacting the server.

use async_trait::async_trait;
use std::sync::Arc;

use crate::flow::{HTTPFlow, TCPFlow};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Addon: Send + Sync {
    /// A complete request has been read from the client.
    async fn request(&self, _flow: &mut HTTPFlow) {}

    /// Response headers have been read; the body has not.
    async fn responseheaders(&self, _flow: &mut HTTPFlow) {}

    async fn response(&self, _flow: &mut HTTPFlow) {}

    /// The flow failed; `flow.flow.error` is set.
    async fn error(&self, _flow: &mut HTTPFlow) {}

    async fn tcp_start(&self, _flow: &mut TCPFlow) {}

    /// The most recent entry of `flow.messages` was just received.
    async fn tcp_message(&self, _flow: &mut TCPFlow) {}

    async fn tcp_error(&self, _flow: &mut TCPFlow) {}

    async fn tcp_end(&self, _flow: &mut TCPFlow) {}
}

/// Addons in registration order.
#[derive(Clone, Default)]
pub struct AddonManager {
    addons: Vec<Arc<dyn Addon>>,
}

impl AddonManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<A: Addon + 'static>(&mut self, addon: A) {
        self.addons.push(Arc::new(addon));
    }

    pub fn add_shared(&mut self, addon: Arc<dyn Addon>) {
        self.addons.push(addon);
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }
}

impl std::fmt::Debug for AddonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonManager")
            .field("addons", &self.addons.len())
            .finish()
    }
}

#[async_trait]
impl Addon for AddonManager {
    async fn request(&self, flow: &mut HTTPFlow) {
        for addon in &self.addons {
            addon.request(flow).await;
        }
    }

    async fn responseheaders(&self, flow: &mut HTTPFlow) {
        for addon in &self.addons {
            addon.responseheaders(flow).await;
        }
    }

    async fn response(&self, flow: &mut HTTPFlow) {
        for addon in &self.addons {
            addon.response(flow).await;
        }
    }

    async fn error(&self, flow: &mut HTTPFlow) {
        for addon in &self.addons {
            addon.error(flow).await;
        }
    }

    async fn tcp_start(&self, flow: &mut TCPFlow) {
        for addon in &self.addons {
            addon.tcp_start(flow).await;
        }
    }

    async fn tcp_message(&self, flow: &mut TCPFlow) {
        for addon in &self.addons {
            addon.tcp_message(flow).await;
        }
    }

    async fn tcp_error(&self, flow: &mut TCPFlow) {
        for addon in &self.addons {
            addon.tcp_error(flow).await;
        }
    }

    async fn tcp_end(&self, flow: &mut TCPFlow) {
        for addon in &self.addons {
            addon.tcp_end(flow).await;
        }
    }
}

/// Applies the `anticache` and `anticomp` options to every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub anticache: bool,
    pub anticomp: bool,
}

#[async_trait]
impl Addon for RequestOptions {
    async fn request(&self, flow: &mut HTTPFlow) {
        if self.anticache {
            flow.request.anticache();
        }
        if self.anticomp {
            flow.request.anticomp();
        }
    }
}
