//! Socket-opt style introspection: a single getter keyed by an option id,
//! returning a JSON document so callers stay decoupled from the snapshot
//! structs.

use serde_json::Value;

use crate::tracer::SocketTracer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sockopt {
    /// Full tracer state: counters, queue stats and per-CPU offset params.
    SocktraceShow,
}

pub fn get(tracer: &SocketTracer, opt: Sockopt) -> Value {
    match opt {
        Sockopt::SocktraceShow => {
            serde_json::to_value(tracer.show()).unwrap_or(Value::Null)
        }
    }
}
