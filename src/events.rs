//! Progress messages sent to whoever is watching an optimization.

use std::sync::mpsc::Sender;
use std::sync::Mutex;

use serde::Serialize;

use crate::circuit::Netlist;
use crate::optimizer::OptimizationResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Event {
    Log(String),
    Update(String),
    /// Simulated curve of the latest evaluation.
    UpdateYData { x: Vec<f64>, y: Vec<f64> },
    /// Netlist carrying the final (or last attempted) component values.
    UpdateNetlist(Box<Netlist>),
    UpdateOptimizationResults(OptimizationResult),
    Done,
    Failed(String),
}

impl Event {
    pub fn tag(&self) -> &'static str {
        match self {
            Event::Log(_) => "Log",
            Event::Update(_) => "Update",
            Event::UpdateYData { .. } => "UpdateYData",
            Event::UpdateNetlist(_) => "UpdateNetlist",
            Event::UpdateOptimizationResults(_) => "UpdateOptimizationResults",
            Event::Done => "Done",
            Event::Failed(_) => "Failed",
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Event::Log(message.into())
    }
}

/// Receiver side of the observer channel. Sending never fails the solve.
pub trait EventSink {
    fn send(&self, event: Event);
}

impl EventSink for Sender<Event> {
    fn send(&self, event: Event) {
        // A dropped receiver just means nobody is watching
        let _ = Sender::send(self, event);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: Event) {}
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::tag).collect()
    }
}

impl EventSink for CollectingSink {
    fn send(&self, event: Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = channel();
        EventSink::send(&tx, Event::log("hello"));
        EventSink::send(&tx, Event::Done);
        drop(tx);

        let received: Vec<Event> = rx.iter().collect();
        assert_eq!(received, vec![Event::Log("hello".to_string()), Event::Done]);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = channel::<Event>();
        drop(rx);
        EventSink::send(&tx, Event::Update("total runs completed: 1".to_string()));
    }

    #[test]
    fn test_collecting_sink_and_serialization() {
        let sink = CollectingSink::new();
        sink.send(Event::UpdateYData { x: vec![0.0], y: vec![1.0] });
        sink.send(Event::Failed("boom".to_string()));
        assert_eq!(sink.tags(), vec!["UpdateYData", "Failed"]);

        let json = serde_json::to_string(&Event::Failed("boom".to_string())).unwrap();
        assert_eq!(json, r#"{"kind":"Failed","payload":"boom"}"#);
    }
}
