// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The event queue and event sink.
//!
//! Interceptors enqueue events (URL captures, DNS queries, process start);
//! the reporter drains the queue once per tick and writes each event as one
//! newline-framed JSON object. The queue is bounded: under a stalled
//! reporter, new events are dropped and counted rather than growing without
//! bound inside someone else's process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::transport::Transport;

const QUEUE_CAP: usize = 1024;

#[derive(Debug, Clone)]
pub struct Event {
    pub ts_ms: i64,
    pub kind: &'static str,
    pub body: Value,
}

impl Event {
    pub fn new(kind: &'static str, body: Value) -> Self {
        Self {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            body,
        }
    }
}

#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, event: Event) {
        let Ok(mut queue) = self.queue.lock() else {
            self.dropped.fetch_add(1, SeqCst);
            return;
        };
        if queue.len() >= QUEUE_CAP {
            self.dropped.fetch_add(1, SeqCst);
            return;
        }
        queue.push_back(event);
    }

    pub fn drain(&self) -> Vec<Event> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(SeqCst)
    }

    pub fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        self.dropped.store(0, SeqCst);
    }
}

pub struct EventSink {
    transport: Transport,
    send_failures: u64,
}

impl EventSink {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            send_failures: 0,
        }
    }

    /// One ndjson line per event, tagged with the reporting identity.
    pub fn send(&mut self, proc_id: &str, event: &Event) {
        let framed = json!({
            "time": event.ts_ms,
            "kind": event.kind,
            "proc": proc_id,
            "body": event.body,
        });
        let mut line = framed.to_string();
        line.push('\n');
        if self.transport.send(line.as_bytes()).is_err() {
            self.send_failures += 1;
        }
    }

    pub fn flush(&mut self) {
        self.transport.flush();
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;

    #[test]
    fn queue_drains_in_order() {
        let queue = EventQueue::new();
        queue.push(Event::new("dns", json!({"name": "example.com"})));
        queue.push(Event::new("url", json!({"url": "GET /"})));
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, "dns");
        assert_eq!(drained[1].kind, "url");
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn queue_drops_past_capacity() {
        let queue = EventQueue::new();
        for _ in 0..QUEUE_CAP + 5 {
            queue.push(Event::new("url", Value::Null));
        }
        assert_eq!(queue.dropped(), 5);
        assert_eq!(queue.drain().len(), QUEUE_CAP);
    }

    #[test]
    fn sink_writes_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        let mut transport = Transport::new(Endpoint::File(path.clone()));
        transport.connect().unwrap();
        let mut sink = EventSink::new(transport);

        sink.send("host-proc-cmd", &Event::new("dns", json!({"name": "example.com"})));
        sink.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(written.trim_end()).unwrap();
        assert_eq!(parsed["kind"], "dns");
        assert_eq!(parsed["proc"], "host-proc-cmd");
        assert_eq!(parsed["body"]["name"], "example.com");
    }
}
