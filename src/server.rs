use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::flow::HTTPFlow;
use crate::http::encoding::DecodeCache;
use crate::http::Message;
use crate::proxy::{AddonManager, Context, PendingFlow, ProxyServer};
use crate::Result;

const PREVIEW_LEN: usize = 60;

pub struct MitmproxyServer {
    config: Config,
    proxy: Arc<ProxyServer>,
    intercepts: Option<mpsc::Receiver<PendingFlow>>,
}

impl MitmproxyServer {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_addons(config, AddonManager::new()).await
    }

    pub async fn with_addons(config: Config, addons: AddonManager) -> Result<Self> {
        config.validate()?;
        let (ctx, intercepts) = Context::from_config(&config, addons)?;
        let proxy = Arc::new(ProxyServer::new(Arc::new(config.clone()), ctx));
        Ok(Self {
            config,
            proxy,
            intercepts,
        })
    }

    pub fn proxy(&self) -> &Arc<ProxyServer> {
        &self.proxy
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting mitmproxy-core server");
        info!("Proxy listening on: {}", self.config.listen_addr());
        if let Some(expression) = &self.config.intercept {
            info!("Intercepting flows matching: {}", expression);
        }

        let listener = self.proxy.bind().await?;
        let proxy_handle = {
            let proxy = Arc::clone(&self.proxy);
            tokio::spawn(async move {
                if let Err(e) = proxy.serve(listener).await {
                    error!("Proxy server error: {}", e);
                }
            })
        };

        let console_handle = self.intercepts.map(|rx| {
            let console = InterceptConsole::new(rx, self.config.decode_cache_size);
            tokio::spawn(console.run(BufReader::new(tokio::io::stdin())))
        });

        tokio::select! {
            _ = proxy_handle => {
                info!("Proxy server shut down");
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Shutting down gracefully"),
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                }
            }
        }

        if let Some(handle) = console_handle {
            handle.abort();
        }
        Ok(())
    }
}

/// Line-based controller for intercepted flows.
///
/// Commands: `l` lists held flows, `r [id]` resumes and `k [id]` kills one
/// (the oldest without an id prefix), `a` resumes all.
pub struct InterceptConsole {
    rx: mpsc::Receiver<PendingFlow>,
    pending: Vec<PendingFlow>,
    cache: DecodeCache,
}

impl InterceptConsole {
    pub fn new(rx: mpsc::Receiver<PendingFlow>, decode_cache_size: usize) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            cache: DecodeCache::new(decode_cache_size),
        }
    }

    pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) {
        let mut lines = input.lines();
        loop {
            tokio::select! {
                pending = self.rx.recv() => match pending {
                    Some(pending) => {
                        println!("intercepted {}", self.describe(&pending.flow));
                        self.pending.push(pending);
                    }
                    None => break,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        for output in self.command(&line) {
                            println!("{}", output);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "console input failed");
                        break;
                    }
                },
            }
        }
        for pending in self.pending.drain(..) {
            pending.resume();
        }
    }

    /// Execute one command line and return what to print.
    pub fn command(&mut self, line: &str) -> Vec<String> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Vec::new();
        };
        let target = parts.next();
        match command {
            "l" | "list" => {
                if self.pending.is_empty() {
                    return vec!["no intercepted flows".to_string()];
                }
                let flows: Vec<HTTPFlow> = self.pending.iter().map(|p| p.flow.clone()).collect();
                flows.iter().map(|flow| self.describe(flow)).collect()
            }
            "r" | "resume" => match self.take(target) {
                Some(pending) => {
                    let line = format!("resumed {}", short_id(pending.id()));
                    pending.resume();
                    vec![line]
                }
                None => vec![no_match(target)],
            },
            "k" | "kill" => match self.take(target) {
                Some(pending) => {
                    let line = format!("killed {}", short_id(pending.id()));
                    pending.kill();
                    vec![line]
                }
                None => vec![no_match(target)],
            },
            "a" | "all" => {
                let count = self.pending.len();
                for pending in self.pending.drain(..) {
                    pending.resume();
                }
                vec![format!("resumed {} flows", count)]
            }
            _ => vec!["commands: l (list), r [id] (resume), k [id] (kill), a (resume all)".to_string()],
        }
    }

    fn take(&mut self, prefix: Option<&str>) -> Option<PendingFlow> {
        let index = match prefix {
            Some(prefix) => self.pending.iter().position(|p| p.id().starts_with(prefix))?,
            None if self.pending.is_empty() => return None,
            None => 0,
        };
        Some(self.pending.remove(index))
    }

    fn describe(&mut self, flow: &HTTPFlow) -> String {
        let mut line = format!(
            "{} {} {}",
            short_id(flow.id()),
            flow.request.method,
            flow.request.url()
        );
        if let Some(response) = &flow.response {
            line.push_str(&format!(" -> {}", response.status_code));
        }
        let preview = match &flow.response {
            Some(response) => self.preview(response),
            None => self.preview(&flow.request),
        };
        if !preview.is_empty() {
            line.push_str(&format!(" [{}]", preview));
        }
        line
    }

    fn preview<M: Message>(&mut self, message: &M) -> String {
        let content = match message.get_decoded_content(Some(&mut self.cache)) {
            Ok(Some(content)) => content,
            Ok(None) => return String::new(),
            Err(_) => message.content().map(|c| c.to_vec()).unwrap_or_default(),
        };
        let text = String::from_utf8_lossy(&content);
        let mut preview: String = text.chars().take(PREVIEW_LEN).collect();
        if text.chars().count() > PREVIEW_LEN {
            preview.push_str("...");
        }
        preview.replace(['\r', '\n'], " ")
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn no_match(target: Option<&str>) -> String {
    match target {
        Some(prefix) => format!("no intercepted flow matches {}", prefix),
        None => "no intercepted flows".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::http::encoding;
    use crate::http::{Headers, Request, Response};
    use crate::proxy::Interceptor;

    #[tokio::test]
    async fn test_server_creation() {
        let config = Config::default();
        let server = MitmproxyServer::new(config).await;
        assert!(server.is_ok());
        assert!(server.unwrap().intercepts.is_none());
    }

    #[tokio::test]
    async fn test_server_rejects_bad_intercept_filter() {
        let config = Config {
            intercept: Some("~bogus".to_string()),
            ..Config::default()
        };
        assert!(MitmproxyServer::new(config).await.is_err());
    }

    fn spawn_intercepted(
        interceptor: &Interceptor,
        path: &str,
    ) -> tokio::task::JoinHandle<(bool, HTTPFlow)> {
        let interceptor = interceptor.clone();
        let mut request = Request::absolute("POST", "http", "example.com", 80, path, "HTTP/1.1");
        request.set_content(b"hello console".to_vec());
        tokio::spawn(async move {
            let mut flow = HTTPFlow::new("client", request);
            let result = interceptor.intercept(&mut flow).await;
            (result.is_ok(), flow)
        })
    }

    #[tokio::test]
    async fn test_console_list_resume_kill() {
        let (interceptor, rx) = Interceptor::new(Filter::new("~all").unwrap(), None);
        let mut console = InterceptConsole::new(rx, 4);

        let first = spawn_intercepted(&interceptor, "/first");
        let pending = console.rx.recv().await.unwrap();
        console.pending.push(pending);
        let second = spawn_intercepted(&interceptor, "/second");
        let pending = console.rx.recv().await.unwrap();
        let second_id = pending.id().to_string();
        console.pending.push(pending);

        let listing = console.command("l");
        assert_eq!(listing.len(), 2);
        assert!(listing[0].contains("example.com/first"));
        assert!(listing[0].contains("[hello console]"));

        let out = console.command(&format!("k {}", &second_id[..8]));
        assert_eq!(out, vec![format!("killed {}", &second_id[..8])]);
        let (ok, flow) = second.await.unwrap();
        assert!(!ok);
        assert!(flow.flow.is_killed());

        assert_eq!(console.command("r").len(), 1);
        let (ok, flow) = first.await.unwrap();
        assert!(ok);
        assert!(!flow.flow.is_intercepted());

        assert_eq!(console.command("r"), vec!["no intercepted flows".to_string()]);
        assert!(console.command("zzz")[0].starts_with("commands:"));
    }

    #[tokio::test]
    async fn test_console_previews_decoded_body() {
        let (_interceptor, rx) = Interceptor::new(Filter::new("~all").unwrap(), None);
        let mut console = InterceptConsole::new(rx, 4);
        let request = Request::absolute("GET", "http", "example.com", 80, "/", "HTTP/1.1");
        let mut flow = HTTPFlow::new("client", request);
        let body = encoding::encode("gzip", b"compressed text").unwrap();
        flow.response = Some(Response::make(
            200,
            body,
            Headers::from_iter([("Content-Encoding", "gzip")]),
        ));
        let line = console.describe(&flow);
        assert!(line.contains("-> 200"));
        assert!(line.ends_with("[compressed text]"));
    }

    #[tokio::test]
    async fn test_console_resumes_held_flows_on_eof() {
        let (interceptor, rx) = Interceptor::new(Filter::new("~all").unwrap(), None);
        let mut console = InterceptConsole::new(rx, 4);
        let held = spawn_intercepted(&interceptor, "/held");
        let pending = console.rx.recv().await.unwrap();
        console.pending.push(pending);

        console.run(&b""[..]).await;
        let (ok, _) = held.await.unwrap();
        assert!(ok);
    }
}
