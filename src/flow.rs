use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::{Message, Request, Response};
use crate::utils::now;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Pending,
    Intercepted,
    Replayed,
    Killed,
    Complete,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Pending => "pending",
            FlowState::Intercepted => "intercepted",
            FlowState::Replayed => "replayed",
            FlowState::Killed => "killed",
            FlowState::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FlowState::Pending),
            "intercepted" => Some(FlowState::Intercepted),
            "replayed" => Some(FlowState::Replayed),
            "killed" => Some(FlowState::Killed),
            "complete" => Some(FlowState::Complete),
            _ => None,
        }
    }
}

/// Error attached to a flow: a message plus the kind of failure that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub msg: String,
    pub kind: String,
    pub timestamp: f64,
}

impl FlowError {
    pub fn new(msg: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            kind: kind.into(),
            timestamp: now(),
        }
    }

    pub fn killed() -> Self {
        Self::new(Error::Killed.to_string(), Error::Killed.kind())
    }
}

impl From<&Error> for FlowError {
    fn from(e: &Error) -> Self {
        Self::new(e.to_string(), e.kind())
    }
}

/// State shared by every flow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub state: FlowState,
    pub is_replay: bool,
    pub error: Option<FlowError>,
    /// Id in the connection registry.
    pub client_conn: String,
    pub server_conn: Option<String>,
    pub marked: String,
    pub comment: String,
    pub timestamp_created: f64,
}

impl Flow {
    pub fn new(client_conn: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: FlowState::Pending,
            is_replay: false,
            error: None,
            client_conn: client_conn.into(),
            server_conn: None,
            marked: String::new(),
            comment: String::new(),
            timestamp_created: now(),
        }
    }

    pub fn is_intercepted(&self) -> bool {
        self.state == FlowState::Intercepted
    }

    pub fn is_killed(&self) -> bool {
        self.state == FlowState::Killed
    }

    pub fn killable(&self) -> bool {
        self.is_intercepted()
    }

    pub fn set_error(&mut self, error: FlowError) {
        self.error = Some(error);
    }

    /// Suspend forwarding. No effect on killed or completed flows.
    pub fn intercept(&mut self) {
        if matches!(self.state, FlowState::Pending | FlowState::Replayed) {
            self.state = FlowState::Intercepted;
        }
    }

    pub fn resume(&mut self) {
        if self.is_intercepted() {
            self.state = if self.is_replay {
                FlowState::Replayed
            } else {
                FlowState::Pending
            };
        }
    }

    /// Abort the flow. Only valid while intercepted.
    pub fn kill(&mut self) -> Result<()> {
        if !self.killable() {
            return Err(Error::internal(format!(
                "cannot kill flow {} in state {}",
                self.id,
                self.state.as_str()
            )));
        }
        self.state = FlowState::Killed;
        self.error = Some(FlowError::killed());
        Ok(())
    }

    /// Record that the flow has been forwarded. Killed flows stay killed.
    pub fn mark_complete(&mut self) {
        if self.state != FlowState::Killed {
            self.state = FlowState::Complete;
        }
    }

    fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        if copy.state == FlowState::Intercepted {
            copy.state = FlowState::Pending;
        }
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HttpSnapshot {
    request: Request,
    response: Option<Response>,
    error: Option<FlowError>,
    marked: String,
    comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HTTPFlow {
    #[serde(flatten)]
    pub flow: Flow,
    pub request: Request,
    pub response: Option<Response>,
    #[serde(skip)]
    backup: Option<Box<HttpSnapshot>>,
}

impl HTTPFlow {
    pub fn new(client_conn: impl Into<String>, request: Request) -> Self {
        Self {
            flow: Flow::new(client_conn),
            request,
            response: None,
            backup: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.flow.id
    }

    fn snapshot(&self) -> HttpSnapshot {
        HttpSnapshot {
            request: self.request.clone(),
            response: self.response.clone(),
            error: self.flow.error.clone(),
            marked: self.flow.marked.clone(),
            comment: self.flow.comment.clone(),
        }
    }

    /// Save the current state so [`revert`](Self::revert) can restore it.
    ///
    /// An existing backup is kept unless `force` is set.
    pub fn backup(&mut self, force: bool) {
        if self.backup.is_none() || force {
            self.backup = Some(Box::new(self.snapshot()));
        }
    }

    pub fn revert(&mut self) {
        if let Some(snapshot) = self.backup.take() {
            let snapshot = *snapshot;
            self.request = snapshot.request;
            self.response = snapshot.response;
            self.flow.error = snapshot.error;
            self.flow.marked = snapshot.marked;
            self.flow.comment = snapshot.comment;
        }
    }

    pub fn modified(&self) -> bool {
        match &self.backup {
            Some(snapshot) => **snapshot != self.snapshot(),
            None => false,
        }
    }

    /// Independent copy under a new id, never intercepted.
    pub fn copy(&self) -> Self {
        Self {
            flow: self.flow.fresh_copy(),
            request: self.request.clone(),
            response: self.response.clone(),
            backup: None,
        }
    }

    pub fn intercept(&mut self) {
        self.flow.intercept();
    }

    pub fn resume(&mut self) {
        self.flow.resume();
    }

    pub fn kill(&mut self) -> Result<()> {
        self.flow.kill()
    }

    /// Regex substitution over request and response headers and decoded bodies.
    pub fn replace(&mut self, pattern: &Regex, repl: &[u8]) -> usize {
        let mut count = self.request.replace(pattern, repl);
        if let Some(response) = self.response.as_mut() {
            count += response.replace(pattern, repl);
        }
        count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpMessage {
    pub from_client: bool,
    pub content: Vec<u8>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TCPFlow {
    #[serde(flatten)]
    pub flow: Flow,
    pub messages: Vec<TcpMessage>,
}

impl TCPFlow {
    pub fn new(client_conn: impl Into<String>, server_conn: impl Into<String>) -> Self {
        let mut flow = Flow::new(client_conn);
        flow.server_conn = Some(server_conn.into());
        Self {
            flow,
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.flow.id
    }

    /// Record a chunk, dropping the oldest ones beyond `max_messages`.
    pub fn push_message(&mut self, from_client: bool, content: Vec<u8>, max_messages: usize) {
        self.messages.push(TcpMessage {
            from_client,
            content,
            timestamp: now(),
        });
        if self.messages.len() > max_messages {
            let excess = self.messages.len() - max_messages;
            self.messages.drain(..excess);
        }
    }

    pub fn copy(&self) -> Self {
        Self {
            flow: self.flow.fresh_copy(),
            messages: self.messages.clone(),
        }
    }

    pub fn replace(&mut self, pattern: &Regex, repl: &[u8]) -> usize {
        let mut count = 0;
        for message in &mut self.messages {
            let hits = pattern.find_iter(&message.content).count();
            if hits > 0 {
                message.content = pattern.replace_all(&message.content, repl).into_owned();
                count += hits;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;

    fn create_test_flow() -> HTTPFlow {
        let mut request = Request::absolute("GET", "https", "example.com", 443, "/path", "HTTP/1.1");
        request.core.headers = Headers::from_iter([("Host", "example.com")]);
        request.set_content(Vec::new());
        HTTPFlow::new("client-1", request)
    }

    #[test]
    fn test_flow_creation() {
        let flow = create_test_flow();
        assert!(!flow.id().is_empty());
        assert_eq!(flow.flow.state, FlowState::Pending);
        assert_eq!(flow.flow.client_conn, "client-1");
        assert!(!flow.modified());
    }

    #[test]
    fn test_kill_only_while_intercepted() {
        let mut flow = create_test_flow();
        assert!(flow.kill().is_err());

        flow.intercept();
        assert!(flow.flow.is_intercepted());
        flow.kill().unwrap();
        assert!(flow.flow.is_killed());
        assert_eq!(flow.flow.error.as_ref().unwrap().kind, "Killed");

        flow.flow.mark_complete();
        assert_eq!(flow.flow.state, FlowState::Killed);
    }

    #[test]
    fn test_resume_returns_to_pending() {
        let mut flow = create_test_flow();
        flow.intercept();
        flow.resume();
        assert_eq!(flow.flow.state, FlowState::Pending);

        flow.flow.is_replay = true;
        flow.intercept();
        flow.resume();
        assert_eq!(flow.flow.state, FlowState::Replayed);
    }

    #[test]
    fn test_completed_flow_cannot_be_intercepted() {
        let mut flow = create_test_flow();
        flow.flow.mark_complete();
        flow.intercept();
        assert_eq!(flow.flow.state, FlowState::Complete);
        assert!(flow.kill().is_err());
    }

    #[test]
    fn test_copy_is_independent() {
        let mut flow = create_test_flow();
        flow.response = Some(Response::make(200, b"hi".to_vec(), Headers::new()));
        flow.intercept();

        let mut copy = flow.copy();
        assert_ne!(copy.id(), flow.id());
        assert_eq!(copy.flow.state, FlowState::Pending);

        copy.request.method = "POST".to_string();
        copy.response.as_mut().unwrap().status_code = 500;
        assert_eq!(flow.request.method, "GET");
        assert_eq!(flow.response.as_ref().unwrap().status_code, 200);
    }

    #[test]
    fn test_backup_and_revert() {
        let mut flow = create_test_flow();
        flow.backup(false);
        flow.request.path = Some("/changed".to_string());
        flow.flow.comment = "edited".to_string();
        assert!(flow.modified());

        // A second backup does not overwrite the first one.
        flow.backup(false);
        flow.revert();
        assert_eq!(flow.request.path.as_deref(), Some("/path"));
        assert_eq!(flow.flow.comment, "");
        assert!(!flow.modified());
    }

    #[test]
    fn test_replace_counts_request_and_response() {
        let mut flow = create_test_flow();
        flow.request.set_content(b"foo bar foo".to_vec());
        let mut response = Response::make(200, b"foo".to_vec(), Headers::from_iter([("X-Foo", "foo")]));
        response.encode("gzip").unwrap();
        flow.response = Some(response);

        let pattern = Regex::new("foo").unwrap();
        let count = flow.replace(&pattern, b"qux");
        // Two in the request body, the X-Foo value, one in the response body.
        assert_eq!(count, 4);

        let response = flow.response.as_ref().unwrap();
        assert_eq!(response.encoding().as_deref(), Some("gzip"));
        assert_eq!(response.get_decoded_content(None).unwrap().unwrap(), b"qux");
        assert_eq!(flow.request.content().unwrap(), b"qux bar qux");
    }

    #[test]
    fn test_tcp_message_history_is_bounded() {
        let mut flow = TCPFlow::new("client-1", "server-1");
        for i in 0..5u8 {
            flow.push_message(i % 2 == 0, vec![i], 3);
        }
        let contents: Vec<Vec<u8>> = flow.messages.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec![vec![2], vec![3], vec![4]]);
        assert!(flow.messages[0].from_client);
    }
}
