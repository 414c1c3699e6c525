//! Incremental parser for the scanner's XML report.
//!
//! The report is parsed as it streams out of the child process: each
//! completed `<host>` subtree yields one [`HostObservation`] without ever
//! buffering the whole document, so a `/16` sweep stays at constant
//! memory. Fragments that cannot be interpreted are skipped.

use std::net::Ipv4Addr;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::AsyncBufRead;
use tracing::{debug, warn};

use eidolon_core::error::ScanError;
use eidolon_core::graph::{HostObservation, OsObservation, PortObservation};
use eidolon_core::types::{PortState, Protocol};

fn parse_err(err: impl std::fmt::Display) -> ScanError {
    ScanError::Parse(err.to_string())
}

/// Pull one attribute off an element as an owned string.
fn attr(element: &BytesStart<'_>, name: &str) -> Option<String> {
    element
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// Fold a leaf element inside `<host>` into the observation.
fn absorb_host_leaf(host: &mut HostObservation, element: &BytesStart<'_>) {
    match element.name().as_ref() {
        b"status" => {
            host.up = attr(element, "state").as_deref() == Some("up");
        }
        b"address" => match attr(element, "addrtype").as_deref() {
            Some("ipv4") | None => {
                host.ip = attr(element, "addr").and_then(|addr| addr.parse::<Ipv4Addr>().ok());
            }
            Some("mac") => {
                host.mac = attr(element, "addr");
                host.vendor = attr(element, "vendor");
            }
            Some(other) => {
                debug!(addrtype = other, "ignoring address record");
            }
        },
        b"hostname" => {
            if host.hostname.is_none() {
                host.hostname = attr(element, "name");
            }
        }
        b"osmatch" => {
            if let Some(name) = attr(element, "name") {
                let accuracy = attr(element, "accuracy")
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(0);
                host.os_matches.push(OsObservation { name, accuracy });
            }
        }
        b"distance" => {
            host.distance = attr(element, "value").and_then(|v| v.parse().ok());
        }
        b"uptime" => {
            host.uptime_seconds = attr(element, "seconds").and_then(|v| v.parse().ok());
        }
        b"times" => {
            host.rtt_srtt_us = attr(element, "srtt").and_then(|v| v.parse().ok());
        }
        _ => {}
    }
}

/// Streaming reader over a scanner XML report.
pub struct ReportParser<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> ReportParser<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        let config = reader.config_mut();
        config.trim_text(true);
        // A killed child truncates the report mid-element; stay permissive
        // and let host-level recovery handle it
        config.check_end_names = false;
        Self {
            reader,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Advance to the next completed `<host>` subtree.
    ///
    /// Returns `None` at the end of the report. A host element that cannot
    /// be fully interpreted is returned with whatever fields were
    /// recovered; the caller decides whether it is usable.
    pub async fn next_host(&mut self) -> Result<Option<HostObservation>, ScanError> {
        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(parse_err)?;
            let is_host_start = match &event {
                Event::Start(e) => e.name().as_ref() == b"host",
                Event::Eof => return Ok(None),
                _ => false,
            };
            if is_host_start {
                let host = self.read_host().await?;
                return Ok(Some(host));
            }
        }
    }

    /// Consume events until `</host>`, accumulating an observation.
    async fn read_host(&mut self) -> Result<HostObservation, ScanError> {
        let mut host = HostObservation::default();

        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(parse_err)?;
            match event {
                Event::Start(e) => {
                    if e.name().as_ref() == b"port" {
                        let proto = attr(&e, "protocol")
                            .and_then(|p| p.parse::<Protocol>().ok())
                            .unwrap_or(Protocol::Tcp);
                        let port = attr(&e, "portid").and_then(|p| p.parse::<u16>().ok());
                        if let Some(observation) = self.read_port(proto, port).await? {
                            host.ports.push(observation);
                        }
                    } else {
                        absorb_host_leaf(&mut host, &e);
                    }
                }
                // A self-closing <port/> has no state and carries nothing
                Event::Empty(e) => {
                    if e.name().as_ref() != b"port" {
                        absorb_host_leaf(&mut host, &e);
                    }
                }
                Event::End(e) => {
                    if e.name().as_ref() == b"host" {
                        return Ok(host);
                    }
                }
                Event::Eof => {
                    warn!("report ended inside a host element");
                    return Ok(host);
                }
                _ => {}
            }
        }
    }

    /// Consume one `<port>` subtree; the opening tag's protocol and port
    /// number are passed in, state and service come from nested children.
    async fn read_port(
        &mut self,
        proto: Protocol,
        port: Option<u16>,
    ) -> Result<Option<PortObservation>, ScanError> {
        let mut state = None;
        let mut service = None;
        let mut product = None;
        let mut version = None;

        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(parse_err)?;
            match event {
                Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                    b"state" => {
                        state = attr(&e, "state").and_then(|s| s.parse::<PortState>().ok());
                    }
                    b"service" => {
                        service = attr(&e, "name");
                        product = attr(&e, "product");
                        version = attr(&e, "version");
                    }
                    _ => {}
                },
                Event::End(e) => {
                    if e.name().as_ref() == b"port" {
                        break;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let Some(port) = port else {
            warn!("port element without a port number, skipping");
            return Ok(None);
        };
        let Some(state) = state else {
            warn!(port, "port element without a state, skipping");
            return Ok(None);
        };

        Ok(Some(PortObservation {
            port,
            proto,
            state,
            service,
            product,
            version,
        }))
    }
}
