// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Metric encoding and the metric sink.
//!
//! Metrics travel as statsd lines,
//! `name:value|type|#tag:value,...`
//! one per line. Counters are monotonically increasing and never reset by the
//! reporter; the downstream is expected to diff. Gauges carry instantaneous
//! measurements (open ports, active connections, process CPU/memory).

use std::fmt::Write as _;

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Count,
    Gauge,
    /// Duration totals, reported in milliseconds.
    Timer,
}

impl MetricKind {
    fn code(self) -> &'static str {
        match self {
            MetricKind::Count => "c",
            MetricKind::Gauge => "g",
            MetricKind::Timer => "ms",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metric<'a> {
    pub name: &'a str,
    pub value: i64,
    pub kind: MetricKind,
    pub tags: &'a [(&'a str, &'a str)],
}

impl Metric<'_> {
    pub fn encode_into(&self, out: &mut String) {
        let _ = write!(out, "{}:{}|{}", self.name, self.value, self.kind.code());
        let mut first = true;
        for (key, value) in self.tags {
            out.push_str(if first { "|#" } else { "," });
            first = false;
            out.push_str(key);
            if !value.is_empty() {
                out.push(':');
                out.push_str(value);
            }
        }
        out.push('\n');
    }
}

/// Buffers encoded lines and writes them through the metric transport on
/// flush, once per periodic tick.
pub struct MetricSink {
    transport: Transport,
    buf: String,
    send_failures: u64,
}

impl MetricSink {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            buf: String::with_capacity(4096),
            send_failures: 0,
        }
    }

    pub fn emit(&mut self, metric: &Metric<'_>) {
        metric.encode_into(&mut self.buf);
    }

    pub fn count(&mut self, name: &str, value: i64, tags: &[(&str, &str)]) {
        self.emit(&Metric {
            name,
            value,
            kind: MetricKind::Count,
            tags,
        });
    }

    pub fn gauge(&mut self, name: &str, value: i64, tags: &[(&str, &str)]) {
        self.emit(&Metric {
            name,
            value,
            kind: MetricKind::Gauge,
            tags,
        });
    }

    pub fn timer_ms(&mut self, name: &str, value: i64, tags: &[(&str, &str)]) {
        self.emit(&Metric {
            name,
            value,
            kind: MetricKind::Timer,
            tags,
        });
    }

    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if self.transport.send(self.buf.as_bytes()).is_err() {
            self.send_failures += 1;
        }
        self.transport.flush();
        self.buf.clear();
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;

    #[test]
    fn encodes_statsd_lines() {
        let mut out = String::new();
        Metric {
            name: "procsight.fs.read",
            value: 4096,
            kind: MetricKind::Count,
            tags: &[("proc", "curl"), ("pid", "42")],
        }
        .encode_into(&mut out);
        assert_eq!(out, "procsight.fs.read:4096|c|#proc:curl,pid:42\n");
    }

    #[test]
    fn encodes_bare_and_valueless_tags() {
        let mut out = String::new();
        Metric {
            name: "procsight.net.port",
            value: -1,
            kind: MetricKind::Gauge,
            tags: &[("summary", "")],
        }
        .encode_into(&mut out);
        assert_eq!(out, "procsight.net.port:-1|g|#summary\n");
    }

    #[test]
    fn sink_buffers_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics");
        let mut transport = Transport::new(Endpoint::File(path.clone()));
        transport.connect().unwrap();
        let mut sink = MetricSink::new(transport);

        sink.count("a", 1, &[]);
        sink.timer_ms("b", 250, &[]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        sink.flush();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "a:1|c\nb:250|ms\n"
        );
    }
}
