//! Addon appending finished flows to a record file.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::FlowWriter;
use crate::connection::ConnectionRegistry;
use crate::filter::FlowRef;
use crate::flow::{HTTPFlow, TCPFlow};
use crate::proxy::hooks::Addon;
use crate::Result;

/// Writes each flow once it is done: HTTP flows on `response` or `error`,
/// TCP flows on `tcp_end`.
pub struct SaveStream {
    writer: Mutex<FlowWriter<BufWriter<File>>>,
    registry: Arc<ConnectionRegistry>,
}

impl std::fmt::Debug for SaveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveStream").finish_non_exhaustive()
    }
}

impl SaveStream {
    /// Open `path` for appending, creating it if needed.
    pub fn create<P: AsRef<Path>>(path: P, registry: Arc<ConnectionRegistry>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(FlowWriter::new(BufWriter::new(file))),
            registry,
        })
    }

    async fn save(&self, flow: FlowRef<'_>) {
        let mut writer = self.writer.lock().await;
        let result = match writer.add_from_registry(flow, &self.registry).await {
            Ok(()) => writer.flush(),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(count = writer.count(), "flow saved"),
            Err(e) => warn!(error = %e, "could not save flow"),
        }
    }
}

#[async_trait]
impl Addon for SaveStream {
    async fn response(&self, flow: &mut HTTPFlow) {
        self.save(FlowRef::from(&*flow)).await;
    }

    async fn error(&self, flow: &mut HTTPFlow) {
        self.save(FlowRef::from(&*flow)).await;
    }

    async fn tcp_end(&self, flow: &mut TCPFlow) {
        self.save(FlowRef::from(&*flow)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Client;
    use crate::flow::FlowError;
    use crate::http::{Request, Response};
    use crate::io::{FlowReader, RecordedFlow};
    use std::io::BufReader;

    #[tokio::test]
    async fn test_saves_finished_flows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.tnet");
        let registry = Arc::new(ConnectionRegistry::new());
        let client_id = registry
            .add_client(Client::new(("127.0.0.1".to_string(), 4000), None, "regular"))
            .await;
        let saver = SaveStream::create(&path, registry.clone()).unwrap();

        let request = Request::absolute("GET", "http", "example.com", 80, "/", "HTTP/1.1");
        let mut ok = HTTPFlow::new(client_id.clone(), request.clone());
        ok.response = Some(Response::make(200, b"fine".to_vec(), Default::default()));
        saver.response(&mut ok).await;

        let mut failed = HTTPFlow::new(client_id.clone(), request);
        failed.flow.set_error(FlowError::new("connection refused", "Io"));
        saver.error(&mut failed).await;

        let mut tcp = TCPFlow::new(client_id, "server-1");
        tcp.push_message(true, b"hello".to_vec(), 10);
        saver.tcp_end(&mut tcp).await;

        let file = File::open(&path).unwrap();
        let records: Vec<_> = FlowReader::new(BufReader::new(file))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        match &records[0].flow {
            RecordedFlow::Http(flow) => {
                assert_eq!(flow.id(), ok.id());
                assert_eq!(flow.response.as_ref().unwrap().status_code, 200);
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(records[0].client.as_ref().unwrap().peername.1, 4000);
        match &records[1].flow {
            RecordedFlow::Http(flow) => assert_eq!(flow.flow.error.as_ref().unwrap().kind, "Io"),
            other => panic!("unexpected record {:?}", other),
        }
        assert!(matches!(records[2].flow, RecordedFlow::Tcp(_)));
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.tnet");
        let registry = Arc::new(ConnectionRegistry::new());
        for _ in 0..2 {
            let saver = SaveStream::create(&path, registry.clone()).unwrap();
            let mut tcp = TCPFlow::new("client", "server");
            saver.tcp_end(&mut tcp).await;
        }
        let file = File::open(&path).unwrap();
        assert_eq!(FlowReader::new(BufReader::new(file)).count(), 2);
    }
}
