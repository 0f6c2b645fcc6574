//! HTTP/1.x inspection with user callbacks.
//!
//! Wraps the incremental scanner in [`parser`] and turns its span events
//! into user callback invocations. Fields that arrive split across
//! segments are joined first, so a callback always sees one complete URL,
//! header name, or header value; body data is streamed through as-is with
//! a flag marking the chunk that completes within the current segment.
//!
//! Callback data is only valid for the duration of the call.

pub(crate) mod parser;

use std::borrow::Cow;

use httparse::{Request, EMPTY_HEADER};

use self::parser::{HttpStream, SpanEvent, SpanKind};
use crate::flowtrack::flow::FlowUserData;
use crate::flowtrack::pdu::PktInfo;
use crate::protocols::packet::tcp::TCP_PROTOCOL;
use crate::protocols::stream::InspectResult;

pub use self::parser::{MessageInfo, MessageKind, Method, MethodOrStatus};

/// Upper bound on configurable header hooks.
pub const MAX_HEADER_HOOKS: usize = 128;

/// Invoked with each reassembled request URL.
pub type HttpUrlHook = Box<dyn FnMut(&[u8], &PktInfo, &mut FlowUserData)>;
/// Invoked with the reassembled value of a matched header.
pub type HttpHeaderHook = Box<dyn FnMut(&MessageInfo, &[u8], &PktInfo, &mut FlowUserData)>;
/// Invoked with each body chunk; the flag marks a chunk that ends within
/// the current segment.
pub type HttpBodyHook = Box<dyn FnMut(&MessageInfo, &[u8], bool, &PktInfo, &mut FlowUserData)>;

/// One header of interest: a name to match case-insensitively and the hook
/// to invoke with its value.
pub struct HttpHeaderEntry {
    pub name: String,
    pub hook: HttpHeaderHook,
}

/// User callback table for HTTP inspection. Hooks are optional per field;
/// fields without a hook are scanned but never buffered.
#[derive(Default)]
pub struct HttpCallbacks {
    pub url: Option<HttpUrlHook>,
    pub headers: Vec<HttpHeaderEntry>,
    pub body: Option<HttpBodyHook>,
}

/// Joins element spans that arrive split across segments.
///
/// The scanner emits spans of one element contiguously, so a single buffer
/// per direction suffices for URL, header-name, and header-value
/// reassembly; body spans are streamed and never buffered.
#[derive(Debug, Default)]
struct SpanAssembly {
    buf: Option<Vec<u8>>,
}

/// Outcome of feeding one span into the assembly.
enum Assembled<'a> {
    /// The element is complete; hand these bytes to the callback.
    Yielded(Cow<'a, [u8]>),
    /// The element continues in a later segment; bytes were buffered.
    Buffered,
}

impl SpanAssembly {
    fn push<'a>(&mut self, data: &'a [u8], complete: bool) -> Assembled<'a> {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
        if !complete {
            if self.buf.is_none() {
                self.buf = Some(data.to_vec());
            }
            return Assembled::Buffered;
        }
        match self.buf.take() {
            Some(joined) => Assembled::Yielded(Cow::Owned(joined)),
            None => Assembled::Yielded(Cow::Borrowed(data)),
        }
    }

    fn clear(&mut self) {
        self.buf = None;
    }
}

/// Per-direction HTTP parser state, stored on the flow.
#[derive(Debug, Default)]
pub(crate) struct HttpDirState {
    stream: HttpStream,
    assembly: SpanAssembly,
    /// Index into the header hook table, latched when a header name
    /// matches and consumed by the following value spans.
    matched_header: Option<usize>,
}

impl HttpDirState {
    fn reset(&mut self) {
        self.stream.reset();
        self.assembly.clear();
        self.matched_header = None;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Probe {
    Certain,
    Unsure,
    NotForUs,
}

/// Quick start-line check on the first bytes of an unidentified direction,
/// before committing to the full scanner.
fn probe(data: &[u8]) -> Probe {
    // number of headers to parse at once
    const NUM_OF_HEADERS: usize = 4;

    if data.len() < 6 {
        return Probe::Unsure;
    }
    match &data[..4] {
        b"OPTI" | b"GET " | b"HEAD" | b"POST" | b"PUT " | b"PATC" | b"DELE" | b"CONN"
        | b"TRAC" | b"HTTP" => (),
        _ => return Probe::NotForUs,
    }
    let mut headers = [EMPTY_HEADER; NUM_OF_HEADERS];
    let mut req = Request::new(&mut headers[..]);
    if let Err(e) = req.parse(data) {
        if e != httparse::Error::TooManyHeaders {
            return Probe::Unsure;
        }
    }
    Probe::Certain
}

/// The HTTP inspector. Holds the (global) callback table; per-flow parser
/// state lives on the flows themselves.
#[derive(Default)]
pub(crate) struct HttpInspector {
    pub(crate) callbacks: Option<HttpCallbacks>,
}

impl HttpInspector {
    /// Runs the inspector over one in-order byte run of a flow direction.
    pub(crate) fn inspect(
        &mut self,
        state: &mut HttpDirState,
        seen_syn: bool,
        user_data: &mut FlowUserData,
        pkt: &PktInfo,
        data: &[u8],
        callbacks_active: bool,
    ) -> InspectResult {
        if pkt.l4proto != TCP_PROTOCOL {
            return InspectResult::NoMatches;
        }
        if data.is_empty() {
            return InspectResult::MoreDataNeeded;
        }
        if !state.stream.started() && probe(data) == Probe::NotForUs {
            return InspectResult::NoMatches;
        }
        match state.stream.advance(data) {
            Ok(events) => {
                if callbacks_active {
                    if let Some(callbacks) = self.callbacks.as_mut() {
                        deliver(callbacks, state, user_data, pkt, events);
                    }
                }
                InspectResult::Matches
            }
            Err(e) => {
                log::debug!("http parse failed: {}", e);
                if !seen_syn {
                    // The flow was joined mid-stream; the scanner may
                    // simply be out of phase with the conversation. Start
                    // over on the next segment instead of rejecting.
                    state.reset();
                    InspectResult::MoreDataNeeded
                } else {
                    InspectResult::NoMatches
                }
            }
        }
    }
}

fn deliver(
    callbacks: &mut HttpCallbacks,
    state: &mut HttpDirState,
    user_data: &mut FlowUserData,
    pkt: &PktInfo,
    events: Vec<SpanEvent<'_>>,
) {
    for event in events {
        match event.kind {
            SpanKind::Url => {
                if let Some(hook) = callbacks.url.as_mut() {
                    if let Assembled::Yielded(url) = state.assembly.push(event.data, event.complete)
                    {
                        hook(url.as_ref(), pkt, user_data);
                    }
                }
            }
            SpanKind::HeaderName => {
                if !callbacks.headers.is_empty() {
                    if let Assembled::Yielded(name) =
                        state.assembly.push(event.data, event.complete)
                    {
                        state.matched_header = callbacks
                            .headers
                            .iter()
                            .position(|h| h.name.as_bytes().eq_ignore_ascii_case(name.as_ref()));
                    }
                }
            }
            SpanKind::HeaderValue => {
                if let Some(index) = state.matched_header {
                    if let Assembled::Yielded(value) =
                        state.assembly.push(event.data, event.complete)
                    {
                        let info = state.stream.message_info();
                        // The table may have been swapped since the name
                        // matched; a stale index is silently dropped.
                        if let Some(entry) = callbacks.headers.get_mut(index) {
                            (entry.hook)(&info, value.as_ref(), pkt, user_data);
                        }
                    }
                }
            }
            SpanKind::Body => {
                if let Some(hook) = callbacks.body.as_mut() {
                    let info = state.stream.message_info();
                    hook(&info, event.data, event.complete, pkt, user_data);
                }
            }
            SpanKind::MessageEnd => {
                state.matched_header = None;
                state.assembly.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pkt() -> PktInfo {
        PktInfo {
            src: "10.0.0.1:40000".parse().unwrap(),
            dst: "10.0.0.2:80".parse().unwrap(),
            l4proto: TCP_PROTOCOL,
            seq_no: 0,
            tcp_flags: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn assembly_joins_split_spans() {
        let mut assembly = SpanAssembly::default();
        assert!(matches!(assembly.push(b"/in", false), Assembled::Buffered));
        match assembly.push(b"dex", true) {
            Assembled::Yielded(joined) => assert_eq!(joined.as_ref(), b"/index"),
            Assembled::Buffered => panic!("expected a complete element"),
        }
        // Buffer is released after yielding.
        match assembly.push(b"/next", true) {
            Assembled::Yielded(Cow::Borrowed(span)) => assert_eq!(span, b"/next"),
            _ => panic!("expected a borrowed span"),
        }
    }

    #[test]
    fn probe_filters_non_http() {
        assert_eq!(probe(b"GET / HTTP/1.1\r\n"), Probe::Certain);
        assert_eq!(probe(b"HTTP/1.1 200 OK\r\n"), Probe::Unsure);
        assert_eq!(probe(b"\x16\x03\x01\x02\x00\x01"), Probe::NotForUs);
        assert_eq!(probe(b"GET"), Probe::Unsure);
    }

    #[test]
    fn split_url_fires_one_callback() {
        let urls: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&urls);
        let mut inspector = HttpInspector {
            callbacks: Some(HttpCallbacks {
                url: Some(Box::new(move |url, _, _| {
                    sink.borrow_mut().push(url.to_vec())
                })),
                ..Default::default()
            }),
        };
        let mut state = HttpDirState::default();
        let mut user_data = None;

        let r1 = inspector.inspect(&mut state, true, &mut user_data, &pkt(), b"GET /in", true);
        assert_eq!(r1, InspectResult::Matches);
        let r2 = inspector.inspect(
            &mut state,
            true,
            &mut user_data,
            &pkt(),
            b"dex HTTP/1.1\r\nHost: x\r\n\r\n",
            true,
        );
        assert_eq!(r2, InspectResult::Matches);
        assert_eq!(urls.borrow().as_slice(), &[b"/index".to_vec()]);
    }

    #[test]
    fn header_hook_matches_case_insensitively() {
        let values: Rc<RefCell<Vec<(Vec<u8>, MethodOrStatus)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&values);
        let mut inspector = HttpInspector {
            callbacks: Some(HttpCallbacks {
                headers: vec![HttpHeaderEntry {
                    name: "host".to_string(),
                    hook: Box::new(move |info, value, _, _| {
                        sink.borrow_mut()
                            .push((value.to_vec(), info.method_or_status))
                    }),
                }],
                ..Default::default()
            }),
        };
        let mut state = HttpDirState::default();
        let mut user_data = None;
        inspector.inspect(
            &mut state,
            true,
            &mut user_data,
            &pkt(),
            b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
            true,
        );
        assert_eq!(
            values.borrow().as_slice(),
            &[(
                b"example.com".to_vec(),
                MethodOrStatus::Method(Method::Get)
            )]
        );
    }

    #[test]
    fn body_hook_sees_last_flag() {
        let chunks: Rc<RefCell<Vec<(Vec<u8>, bool)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&chunks);
        let mut inspector = HttpInspector {
            callbacks: Some(HttpCallbacks {
                body: Some(Box::new(move |_, data, last, _, _| {
                    sink.borrow_mut().push((data.to_vec(), last))
                })),
                ..Default::default()
            }),
        };
        let mut state = HttpDirState::default();
        let mut user_data = None;
        inspector.inspect(
            &mut state,
            true,
            &mut user_data,
            &pkt(),
            b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc",
            true,
        );
        inspector.inspect(&mut state, true, &mut user_data, &pkt(), b"def", true);
        assert_eq!(
            chunks.borrow().as_slice(),
            &[(b"abc".to_vec(), false), (b"def".to_vec(), true)]
        );
    }

    #[test]
    fn mid_stream_error_resets_and_waits() {
        let mut inspector = HttpInspector::default();
        let mut state = HttpDirState::default();
        let mut user_data = None;
        // Bytes that pass the probe but fail the scanner.
        let result = inspector.inspect(
            &mut state,
            false,
            &mut user_data,
            &pkt(),
            b"GET / garbage\r\n\r\n",
            false,
        );
        assert_eq!(result, InspectResult::MoreDataNeeded);
        assert!(!state.stream.started());
    }

    #[test]
    fn non_tcp_never_matches() {
        let mut inspector = HttpInspector::default();
        let mut state = HttpDirState::default();
        let mut user_data = None;
        let mut info = pkt();
        info.l4proto = 17;
        let result = inspector.inspect(
            &mut state,
            true,
            &mut user_data,
            &info,
            b"GET / HTTP/1.1\r\n\r\n",
            false,
        );
        assert_eq!(result, InspectResult::NoMatches);
    }
}
