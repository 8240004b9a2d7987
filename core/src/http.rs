//! HTTP request/response values.
//!
//! # Design
//! Requests and responses are plain data. `RequestEncoder` builds an
//! `HttpRequest`, a `Transport` turns it into an `HttpResponse`, and
//! `ResponseValidator` parses the response. Only the transport touches the
//! network, so everything on either side of it is deterministic and can be
//! tested without a server.

/// Retry class of a request.
///
/// Reads can be re-sent after a transient failure. Writes are full-object
/// replaces and are never re-sent automatically: after an ambiguous failure
/// the first attempt may already have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Read,
    Write,
}

/// An RPC call described as plain data. Always sent as a POST.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub class: RequestClass,
    /// Wire name of the operation, for logging.
    pub kind: &'static str,
    /// Whether the transport should attach the ambient session credentials.
    pub send_credentials: bool,
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
