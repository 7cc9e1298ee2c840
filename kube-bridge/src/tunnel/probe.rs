//! Recognise HTTP health probes so the agent can answer them itself
//!
//! Only the start of a connection is inspected. Bytes are held back while they
//! may still turn into a probe request and released as soon as they cannot.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

/// Reply sent for a recognised probe request
pub const PROBE_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// Longest request head held back waiting for the rest of a probe
const MAX_PROBE_REQUEST: usize = 8 * 1024;

const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniffed {
    /// A complete probe request of this many bytes
    Probe(usize),
    /// Could still become a probe
    Incomplete,
    Other,
}

fn sniff(data: &[u8], probe_paths: &[String]) -> Sniffed {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(data) {
        Ok(httparse::Status::Complete(len)) => match request.path {
            Some(path) if is_probe_path(path, probe_paths) => Sniffed::Probe(len),
            _ => Sniffed::Other,
        },
        Ok(httparse::Status::Partial) => match request.path {
            Some(path) if !is_probe_path(path, probe_paths) => Sniffed::Other,
            _ => Sniffed::Incomplete,
        },
        Err(_) => Sniffed::Other,
    }
}

fn is_probe_path(path: &str, probe_paths: &[String]) -> bool {
    probe_paths
        .iter()
        .any(|probe| !probe.is_empty() && path.starts_with(probe.as_str()))
}

/// Result of feeding one socket read through a [`ProbeFilter`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filtered {
    /// Probe requests to answer with [`PROBE_RESPONSE`]
    pub answered: usize,
    /// Bytes to forward to the tunnel
    pub forward: Option<Bytes>,
}

/// Per-connection probe detection.
#[derive(Debug)]
pub struct ProbeFilter {
    probe_paths: Arc<Vec<String>>,
    held: BytesMut,
    active: bool,
}

impl ProbeFilter {
    pub fn new(probe_paths: Arc<Vec<String>>) -> Self {
        let active = !probe_paths.is_empty();
        Self {
            probe_paths,
            held: BytesMut::new(),
            active,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(Vec::new()))
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Filtered {
        if !self.active {
            return Filtered {
                answered: 0,
                forward: Some(Bytes::copy_from_slice(chunk)),
            };
        }
        self.held.extend_from_slice(chunk);

        let mut answered = 0;
        while !self.held.is_empty() {
            match sniff(&self.held, &self.probe_paths) {
                Sniffed::Probe(len) => {
                    self.held.advance(len);
                    answered += 1;
                }
                Sniffed::Incomplete if self.held.len() < MAX_PROBE_REQUEST => break,
                _ => {
                    // not a probe connection; stop looking
                    self.active = false;
                    return Filtered {
                        answered,
                        forward: Some(self.held.split().freeze()),
                    };
                }
            }
        }
        Filtered {
            answered,
            forward: None,
        }
    }

    /// Bytes still held back when the socket reached EOF.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.active = false;
        (!self.held.is_empty()).then(|| self.held.split().freeze())
    }
}
