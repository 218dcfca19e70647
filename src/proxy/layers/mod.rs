//! Protocol layers driving one client connection.

use tokio::io::{ReadHalf, WriteHalf};

use crate::http::Request;
use crate::proxy::context::Context;
use crate::proxy::upstream::BoxedStream;
use crate::stream::{Reader, Writer};

pub mod http;
pub mod http2;
pub mod tcp;

pub use http::{Http1Layer, Http1Outcome};
pub use http2::Http2Layer;
pub use tcp::TcpLayer;

pub type ClientReader = Reader<ReadHalf<BoxedStream>>;
pub type ClientWriter = Writer<WriteHalf<BoxedStream>>;

/// Point an origin-form request at the tunnel or reverse target, so that the
/// flow records where it actually went.
pub(crate) fn fill_target(ctx: &Context, request: &mut Request) {
    let target = ctx
        .tunnel_target
        .as_ref()
        .or(ctx.options.reverse_target.as_ref());
    if let Some((host, port)) = target {
        if request.first_line_format == crate::http::FirstLineFormat::Relative {
            request.host = Some(host.clone());
            request.port = Some(*port);
            if request.scheme.is_none() {
                request.scheme = Some("http".to_string());
            }
        }
    }
}
