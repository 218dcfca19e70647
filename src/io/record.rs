//! Persisted flow records: one tnetstring dictionary per flow.
//!
//! Bodies are stored as `bytes`, `null` when the body was not captured and
//! `false` when the message has no body at all. Connection descriptors are
//! embedded as snapshots; without one only the connection id is kept.

use indexmap::IndexMap;
use std::io::{BufRead, Write};

use super::tnetstring::{self, TValue};
use crate::connection::{Address, Client, ConnectionRegistry, ConnectionState, Server};
use crate::filter::FlowRef;
use crate::flow::{Flow, FlowError, FlowState, HTTPFlow, TCPFlow, TcpMessage};
use crate::http::{Content, FirstLineFormat, Headers, MessageCore, Request, Response};
use crate::{Error, Result};

pub const FORMAT_VERSION: i64 = 1;

/// A flow read back from a record, with its connection snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub flow: RecordedFlow,
    pub client: Option<Client>,
    pub server: Option<Server>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedFlow {
    Http(HTTPFlow),
    Tcp(TCPFlow),
}

impl RecordedFlow {
    pub fn as_flow_ref(&self) -> FlowRef<'_> {
        match self {
            RecordedFlow::Http(f) => FlowRef::Http(f),
            RecordedFlow::Tcp(f) => FlowRef::Tcp(f),
        }
    }
}

type Dict = IndexMap<String, TValue>;

fn dict<const N: usize>(entries: [(&str, TValue); N]) -> TValue {
    TValue::Dict(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn opt_float(v: Option<f64>) -> TValue {
    v.map_or(TValue::Null, TValue::Float)
}

fn address(a: &Address) -> TValue {
    TValue::List(vec![TValue::from(a.0.as_str()), TValue::Int(a.1 as i64)])
}

fn opt_address(a: &Option<Address>) -> TValue {
    a.as_ref().map_or(TValue::Null, address)
}

fn headers_state(headers: &Headers) -> TValue {
    TValue::List(
        headers
            .iter()
            .map(|(n, v)| TValue::List(vec![TValue::Bytes(n.to_vec()), TValue::Bytes(v.to_vec())]))
            .collect(),
    )
}

fn content_state(content: &Content) -> TValue {
    match content {
        Content::Absent => TValue::Bool(false),
        Content::Missing => TValue::Null,
        Content::Data(data) => TValue::Bytes(data.clone()),
    }
}

fn core_entries(core: &MessageCore) -> Vec<(&'static str, TValue)> {
    vec![
        ("http_version", TValue::from(core.http_version.as_str())),
        ("headers", headers_state(&core.headers)),
        ("content", content_state(&core.content)),
        ("timestamp_start", opt_float(core.timestamp_start)),
        ("timestamp_end", opt_float(core.timestamp_end)),
    ]
}

fn with_core(core: &MessageCore, rest: Vec<(&'static str, TValue)>) -> TValue {
    TValue::Dict(
        core_entries(core)
            .into_iter()
            .chain(rest)
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

pub fn request_state(request: &Request) -> TValue {
    with_core(
        &request.core,
        vec![
            ("method", TValue::from(request.method.as_str())),
            ("scheme", TValue::from(request.scheme.clone())),
            ("host", TValue::from(request.host.clone())),
            ("port", request.port.map_or(TValue::Null, |p| TValue::Int(p as i64))),
            ("path", TValue::from(request.path.clone())),
            (
                "first_line_format",
                TValue::from(request.first_line_format.as_str()),
            ),
        ],
    )
}

pub fn response_state(response: &Response) -> TValue {
    with_core(
        &response.core,
        vec![
            ("status_code", TValue::Int(response.status_code as i64)),
            ("reason", TValue::from(response.reason.as_str())),
        ],
    )
}

fn error_state(error: &Option<FlowError>) -> TValue {
    match error {
        Some(e) => dict([
            ("msg", TValue::from(e.msg.as_str())),
            ("kind", TValue::from(e.kind.as_str())),
            ("timestamp", TValue::Float(e.timestamp)),
        ]),
        None => TValue::Null,
    }
}

fn state_state(state: &ConnectionState) -> TValue {
    dict([
        ("can_read", TValue::Bool(state.can_read)),
        ("can_write", TValue::Bool(state.can_write)),
    ])
}

pub fn client_state(client: &Client) -> TValue {
    dict([
        ("id", TValue::from(client.id.as_str())),
        ("peername", address(&client.peername)),
        ("sockname", opt_address(&client.sockname)),
        ("state", state_state(&client.state)),
        ("proxy_mode", TValue::from(client.proxy_mode.as_str())),
        ("protocol", TValue::from(client.protocol.clone())),
        ("timestamp_start", TValue::Float(client.timestamp_start)),
        ("timestamp_end", opt_float(client.timestamp_end)),
        ("error", TValue::from(client.error.clone())),
    ])
}

pub fn server_state(server: &Server) -> TValue {
    dict([
        ("id", TValue::from(server.id.as_str())),
        ("address", address(&server.address)),
        ("peername", opt_address(&server.peername)),
        ("sockname", opt_address(&server.sockname)),
        ("state", state_state(&server.state)),
        ("protocol", TValue::from(server.protocol.clone())),
        ("timestamp_start", opt_float(server.timestamp_start)),
        ("timestamp_tcp_setup", opt_float(server.timestamp_tcp_setup)),
        ("timestamp_end", opt_float(server.timestamp_end)),
        ("error", TValue::from(server.error.clone())),
    ])
}

fn flow_entries(
    flow: &Flow,
    kind: &str,
    client: Option<&Client>,
    server: Option<&Server>,
) -> Vec<(&'static str, TValue)> {
    let client_conn = match client {
        Some(c) => client_state(c),
        None => dict([("id", TValue::from(flow.client_conn.as_str()))]),
    };
    let server_conn = match (server, &flow.server_conn) {
        (Some(s), _) => server_state(s),
        (None, Some(id)) => dict([("id", TValue::from(id.as_str()))]),
        (None, None) => TValue::Null,
    };
    vec![
        ("version", TValue::Int(FORMAT_VERSION)),
        ("type", TValue::from(kind)),
        ("id", TValue::from(flow.id.as_str())),
        ("state", TValue::from(flow.state.as_str())),
        ("is_replay", TValue::Bool(flow.is_replay)),
        ("error", error_state(&flow.error)),
        ("client_conn", client_conn),
        ("server_conn", server_conn),
        ("marked", TValue::from(flow.marked.as_str())),
        ("comment", TValue::from(flow.comment.as_str())),
        ("timestamp_created", TValue::Float(flow.timestamp_created)),
    ]
}

/// Full state of a flow as a tnetstring value.
pub fn flow_state(flow: FlowRef<'_>, client: Option<&Client>, server: Option<&Server>) -> TValue {
    let entries = match flow {
        FlowRef::Http(f) => {
            let mut entries = flow_entries(&f.flow, "http", client, server);
            entries.push(("request", request_state(&f.request)));
            entries.push((
                "response",
                f.response.as_ref().map_or(TValue::Null, response_state),
            ));
            entries
        }
        FlowRef::Tcp(f) => {
            let mut entries = flow_entries(&f.flow, "tcp", client, server);
            let messages = f
                .messages
                .iter()
                .map(|m| {
                    TValue::List(vec![
                        TValue::Bool(m.from_client),
                        TValue::Bytes(m.content.clone()),
                        TValue::Float(m.timestamp),
                    ])
                })
                .collect();
            entries.push(("messages", TValue::List(messages)));
            entries
        }
    };
    TValue::Dict(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

// Reading

fn field<'a>(d: &'a Dict, key: &str) -> Result<&'a TValue> {
    d.get(key)
        .ok_or_else(|| Error::record(format!("missing field {:?}", key)))
}

fn wrong_type(key: &str, expected: &str, got: &TValue) -> Error {
    Error::record(format!(
        "field {:?}: expected {}, got {}",
        key,
        expected,
        got.type_name()
    ))
}

fn get_dict<'a>(d: &'a Dict, key: &str) -> Result<&'a Dict> {
    let v = field(d, key)?;
    v.as_dict().ok_or_else(|| wrong_type(key, "dict", v))
}

fn get_str(d: &Dict, key: &str) -> Result<String> {
    let v = field(d, key)?;
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| wrong_type(key, "string", v))
}

fn get_opt_str(d: &Dict, key: &str) -> Result<Option<String>> {
    match d.get(key) {
        None | Some(TValue::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| wrong_type(key, "string", v)),
    }
}

fn get_float(d: &Dict, key: &str) -> Result<f64> {
    let v = field(d, key)?;
    v.as_float().ok_or_else(|| wrong_type(key, "float", v))
}

fn get_opt_float(d: &Dict, key: &str) -> Result<Option<f64>> {
    match d.get(key) {
        None | Some(TValue::Null) => Ok(None),
        Some(v) => v.as_float().map(Some).ok_or_else(|| wrong_type(key, "float", v)),
    }
}

fn get_bool(d: &Dict, key: &str) -> Result<bool> {
    let v = field(d, key)?;
    v.as_bool().ok_or_else(|| wrong_type(key, "bool", v))
}

fn get_u16(d: &Dict, key: &str) -> Result<u16> {
    let v = field(d, key)?;
    v.as_int()
        .and_then(|i| u16::try_from(i).ok())
        .ok_or_else(|| wrong_type(key, "16-bit integer", v))
}

fn parse_address(key: &str, v: &TValue) -> Result<Address> {
    match v.as_list() {
        Some([host, port]) => {
            let host = host.as_str().ok_or_else(|| wrong_type(key, "host", host))?;
            let port = port
                .as_int()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| wrong_type(key, "port", port))?;
            Ok((host.to_string(), port))
        }
        _ => Err(wrong_type(key, "[host, port]", v)),
    }
}

fn get_opt_address(d: &Dict, key: &str) -> Result<Option<Address>> {
    match d.get(key) {
        None | Some(TValue::Null) => Ok(None),
        Some(v) => parse_address(key, v).map(Some),
    }
}

fn get_headers(d: &Dict) -> Result<Headers> {
    let v = field(d, "headers")?;
    let list = v.as_list().ok_or_else(|| wrong_type("headers", "list", v))?;
    let mut headers = Headers::new();
    for entry in list {
        match entry.as_list() {
            Some([name, value]) => match (name.as_bytes(), value.as_bytes()) {
                (Some(n), Some(v)) => headers.append(n, v),
                _ => return Err(wrong_type("headers", "[name, value]", entry)),
            },
            _ => return Err(wrong_type("headers", "[name, value]", entry)),
        }
    }
    Ok(headers)
}

fn get_content(d: &Dict) -> Result<Content> {
    match field(d, "content")? {
        TValue::Null => Ok(Content::Missing),
        TValue::Bool(false) => Ok(Content::Absent),
        TValue::Bytes(data) => Ok(Content::Data(data.clone())),
        other => Err(wrong_type("content", "bytes", other)),
    }
}

fn get_core(d: &Dict) -> Result<MessageCore> {
    Ok(MessageCore {
        http_version: get_str(d, "http_version")?,
        headers: get_headers(d)?,
        content: get_content(d)?,
        timestamp_start: get_opt_float(d, "timestamp_start")?,
        timestamp_end: get_opt_float(d, "timestamp_end")?,
    })
}

pub fn request_from_state(d: &Dict) -> Result<Request> {
    let format = get_str(d, "first_line_format")?;
    Ok(Request {
        core: get_core(d)?,
        method: get_str(d, "method")?,
        scheme: get_opt_str(d, "scheme")?,
        host: get_opt_str(d, "host")?,
        port: match d.get("port") {
            None | Some(TValue::Null) => None,
            Some(_) => Some(get_u16(d, "port")?),
        },
        path: get_opt_str(d, "path")?,
        first_line_format: FirstLineFormat::parse(&format)
            .ok_or_else(|| Error::record(format!("unknown first_line_format {:?}", format)))?,
    })
}

pub fn response_from_state(d: &Dict) -> Result<Response> {
    Ok(Response {
        core: get_core(d)?,
        status_code: get_u16(d, "status_code")?,
        reason: get_str(d, "reason")?,
    })
}

fn get_error(d: &Dict) -> Result<Option<FlowError>> {
    match d.get("error") {
        None | Some(TValue::Null) => Ok(None),
        Some(_) => {
            let e = get_dict(d, "error")?;
            Ok(Some(FlowError {
                msg: get_str(e, "msg")?,
                kind: get_str(e, "kind")?,
                timestamp: get_float(e, "timestamp")?,
            }))
        }
    }
}

fn get_state(d: &Dict) -> Result<ConnectionState> {
    let s = get_dict(d, "state")?;
    Ok(ConnectionState {
        can_read: get_bool(s, "can_read")?,
        can_write: get_bool(s, "can_write")?,
    })
}

pub fn client_from_state(d: &Dict) -> Result<Client> {
    Ok(Client {
        id: get_str(d, "id")?,
        peername: parse_address("peername", field(d, "peername")?)?,
        sockname: get_opt_address(d, "sockname")?,
        state: get_state(d)?,
        proxy_mode: get_str(d, "proxy_mode")?,
        protocol: get_opt_str(d, "protocol")?,
        timestamp_start: get_float(d, "timestamp_start")?,
        timestamp_end: get_opt_float(d, "timestamp_end")?,
        error: get_opt_str(d, "error")?,
    })
}

pub fn server_from_state(d: &Dict) -> Result<Server> {
    Ok(Server {
        id: get_str(d, "id")?,
        address: parse_address("address", field(d, "address")?)?,
        peername: get_opt_address(d, "peername")?,
        sockname: get_opt_address(d, "sockname")?,
        state: get_state(d)?,
        protocol: get_opt_str(d, "protocol")?,
        timestamp_start: get_opt_float(d, "timestamp_start")?,
        timestamp_tcp_setup: get_opt_float(d, "timestamp_tcp_setup")?,
        timestamp_end: get_opt_float(d, "timestamp_end")?,
        error: get_opt_str(d, "error")?,
    })
}

fn get_tcp_messages(d: &Dict) -> Result<Vec<TcpMessage>> {
    let v = field(d, "messages")?;
    let list = v.as_list().ok_or_else(|| wrong_type("messages", "list", v))?;
    list.iter()
        .map(|m| match m.as_list() {
            Some([TValue::Bool(from_client), TValue::Bytes(content), ts]) => Ok(TcpMessage {
                from_client: *from_client,
                content: content.clone(),
                timestamp: ts.as_float().ok_or_else(|| wrong_type("messages", "float", ts))?,
            }),
            _ => Err(wrong_type("messages", "[bool, bytes, float]", m)),
        })
        .collect()
}

/// Rebuild a flow and its connection snapshots from a record.
pub fn flow_from_state(value: &TValue) -> Result<Recorded> {
    let d = value
        .as_dict()
        .ok_or_else(|| Error::record(format!("expected dict, got {}", value.type_name())))?;

    let version = field(d, "version")?
        .as_int()
        .ok_or_else(|| Error::record("invalid version"))?;
    if version > FORMAT_VERSION {
        return Err(Error::record(format!(
            "unsupported record version {}",
            version
        )));
    }

    let client_dict = get_dict(d, "client_conn")?;
    let client = if client_dict.len() > 1 {
        Some(client_from_state(client_dict)?)
    } else {
        None
    };
    let (server_id, server) = match d.get("server_conn") {
        None | Some(TValue::Null) => (None, None),
        Some(_) => {
            let server_dict = get_dict(d, "server_conn")?;
            let server = if server_dict.len() > 1 {
                Some(server_from_state(server_dict)?)
            } else {
                None
            };
            (Some(get_str(server_dict, "id")?), server)
        }
    };

    let state = get_str(d, "state")?;
    let flow = Flow {
        id: get_str(d, "id")?,
        state: FlowState::parse(&state)
            .ok_or_else(|| Error::record(format!("unknown flow state {:?}", state)))?,
        is_replay: get_bool(d, "is_replay")?,
        error: get_error(d)?,
        client_conn: get_str(client_dict, "id")?,
        server_conn: server_id,
        marked: get_str(d, "marked")?,
        comment: get_str(d, "comment")?,
        timestamp_created: get_float(d, "timestamp_created")?,
    };

    let kind = get_str(d, "type")?;
    let recorded = match kind.as_str() {
        "http" => {
            let request = request_from_state(get_dict(d, "request")?)?;
            let response = match d.get("response") {
                None | Some(TValue::Null) => None,
                Some(_) => Some(response_from_state(get_dict(d, "response")?)?),
            };
            let mut http = HTTPFlow::new(flow.client_conn.clone(), request);
            http.flow = flow;
            http.response = response;
            RecordedFlow::Http(http)
        }
        "tcp" => RecordedFlow::Tcp(TCPFlow {
            flow,
            messages: get_tcp_messages(d)?,
        }),
        other => return Err(Error::record(format!("unknown flow type {:?}", other))),
    };

    Ok(Recorded {
        flow: recorded,
        client,
        server,
    })
}

/// Appends flows to a byte sink.
pub struct FlowWriter<W: Write> {
    inner: W,
    count: usize,
}

impl<W: Write> FlowWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn add<'a>(
        &mut self,
        flow: impl Into<FlowRef<'a>>,
        client: Option<&Client>,
        server: Option<&Server>,
    ) -> Result<()> {
        tnetstring::dump(&flow_state(flow.into(), client, server), &mut self.inner)?;
        self.count += 1;
        Ok(())
    }

    /// Like [`add`](Self::add), taking connection snapshots from the registry.
    pub async fn add_from_registry<'a>(
        &mut self,
        flow: impl Into<FlowRef<'a>>,
        registry: &ConnectionRegistry,
    ) -> Result<()> {
        let flow = flow.into();
        let meta = match flow {
            FlowRef::Http(f) => &f.flow,
            FlowRef::Tcp(f) => &f.flow,
        };
        let client = registry.client(&meta.client_conn).await;
        let server = match &meta.server_conn {
            Some(id) => registry.server(id).await,
            None => None,
        };
        self.add(flow, client.as_ref(), server.as_ref())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads flows back, one record at a time.
pub struct FlowReader<R: BufRead> {
    inner: R,
}

impl<R: BufRead> FlowReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next flow, or `None` at the end of the input.
    pub fn read_next(&mut self) -> Result<Option<Recorded>> {
        match tnetstring::load(&mut self.inner)? {
            Some(value) => flow_from_state(&value).map(Some),
            None => Ok(None),
        }
    }
}

impl<R: BufRead> Iterator for FlowReader<R> {
    type Item = Result<Recorded>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

impl From<FlowRef<'_>> for RecordedFlow {
    fn from(flow: FlowRef<'_>) -> Self {
        match flow {
            FlowRef::Http(f) => RecordedFlow::Http(f.clone()),
            FlowRef::Tcp(f) => RecordedFlow::Tcp(f.clone()),
        }
    }
}
