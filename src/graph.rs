//! Latency-sample sink.
//!
//! The engine emits one buffered-latency sample per source period. Hosts
//! that render timing graphs implement [`GraphSink`]; headless hosts use
//! [`NullGraphSink`]. Samples ride a fixed-capacity overwrite-oldest queue
//! so a stalled consumer only ever loses the oldest history.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Handle returned by [`GraphSink::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphId(pub u64);

/// Renders a graph title from its running statistics.
pub type GraphFormatter = fn(name: &str, min: f32, max: f32, avg: f32, freq: f32, last: f32) -> String;

/// Consumer of per-period latency samples.
pub trait GraphSink: Send + Sync {
    /// Register a sample queue for display. `min`/`max` bound the display
    /// range; out-of-range samples are clipped by the sink.
    fn register(
        &self,
        name: &'static str,
        samples: Arc<ArrayQueue<f32>>,
        min: f32,
        max: f32,
        formatter: GraphFormatter,
    ) -> GraphId;

    /// Mark the graph dirty after new samples were pushed.
    fn invalidate(&self, id: GraphId);

    /// Drop a registration when its stream stops.
    fn unregister(&self, id: GraphId);
}

/// Sink for hosts without a timing display.
pub struct NullGraphSink;

impl GraphSink for NullGraphSink {
    fn register(
        &self,
        _name: &'static str,
        _samples: Arc<ArrayQueue<f32>>,
        _min: f32,
        _max: f32,
        _formatter: GraphFormatter,
    ) -> GraphId {
        GraphId(0)
    }

    fn invalidate(&self, _id: GraphId) {}

    fn unregister(&self, _id: GraphId) {}
}

/// Default title formatter for the playback latency graph.
pub fn latency_graph_title(
    name: &str,
    min: f32,
    max: f32,
    avg: f32,
    _freq: f32,
    last: f32,
) -> String {
    format!("{name}: min:{min:4.2} max:{max:4.2} avg:{avg:4.2} now:{last:4.2}")
}
