//! Trace-id pairing: the decision half of the trace engine.
//!
//! A request opens a thread trace (client egress or server ingress alike);
//! the paired message on a *different* socket consumes it, and egress on the
//! same socket never cross-links. The kernel programs apply the returned
//! operations to the trace map; unit tests drive the same transitions
//! directly.

use crate::{Direction, MessageType, SocketInfo, TraceInfo};

/// Map operation the caller must apply after a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceOp {
    None,
    /// Insert or replace the thread's entry.
    Put(PendingTrace),
    /// Remove the thread's entry.
    Delete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingTrace {
    pub thread_trace_id: u64,
    pub socket_id: u64,
    pub peer_fd: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct TraceDecision {
    /// Id stamped on the emitted record; 0 when no pairing applies.
    pub thread_trace_id: u64,
    /// Suppress the per-session sequence increment (fragment concatenation).
    pub keep_data_seq: bool,
    pub op: TraceOp,
    /// The parked id on the session was emitted and must be cleared.
    pub consume_parked: bool,
}

impl TraceDecision {
    const fn plain(thread_trace_id: u64, keep_data_seq: bool, op: TraceOp) -> Self {
        Self {
            thread_trace_id,
            keep_data_seq,
            op,
            consume_parked: false,
        }
    }
}

/// Decide the trace transition for one event.
///
/// `socket` is the session state as found at event arrival, before any update
/// from this event; the same-direction-burst comparison is defined against
/// that snapshot. `socket_id` is the session uid, `fd` the triggering fd.
pub fn trace_transition<F: FnMut() -> u64>(
    direction: Direction,
    msg_type: MessageType,
    existing: Option<&TraceInfo>,
    socket: &SocketInfo,
    socket_id: u64,
    fd: u32,
    is_go_process: bool,
    mut next_id: F,
) -> TraceDecision {
    let keep_data_seq = matches!(msg_type, MessageType::Request | MessageType::Response)
        && direction as u8 == socket.direction
        && msg_type as u8 == socket.msg_type;

    // Goroutine-traced processes are correlated by the uprobe collaborator;
    // the thread-trace path stays out of their way entirely.
    if is_go_process {
        return TraceDecision::plain(0, keep_data_seq, TraceOp::None);
    }

    match existing {
        // Aligned burst on one socket: the open trace continues and the
        // sequence is reused so userspace can concatenate fragments.
        Some(prior) if keep_data_seq => {
            TraceDecision::plain(prior.thread_trace_id, true, TraceOp::None)
        }

        Some(prior) => match direction {
            Direction::Ingress => match msg_type {
                // A fresh inbound request supersedes whatever was left open.
                MessageType::Request => {
                    let id = next_id();
                    TraceDecision::plain(
                        id,
                        false,
                        TraceOp::Put(PendingTrace {
                            thread_trace_id: id,
                            socket_id,
                            peer_fd: fd,
                        }),
                    )
                }
                // The response a client was waiting for: emit the open id and
                // close the trace.
                _ => TraceDecision::plain(prior.thread_trace_id, false, TraceOp::Delete),
            },
            Direction::Egress => {
                if prior.socket_id == socket_id {
                    // Same socket: reply on the ingress fd, nothing to link.
                    TraceDecision::plain(0, false, TraceOp::Delete)
                } else {
                    // Different socket on the same thread: this is the paired
                    // half (relay or client fan-out).
                    TraceDecision::plain(prior.thread_trace_id, false, TraceOp::Delete)
                }
            }
            Direction::Unknown => TraceDecision::plain(0, keep_data_seq, TraceOp::None),
        },

        None => match (direction, msg_type) {
            // A request opens a trace whichever way it flows.
            (_, MessageType::Request) if direction != Direction::Unknown => {
                let id = next_id();
                TraceDecision::plain(
                    id,
                    keep_data_seq,
                    TraceOp::Put(PendingTrace {
                        thread_trace_id: id,
                        socket_id,
                        peer_fd: fd,
                    }),
                )
            }
            // A response arriving with no open trace still opens one so the
            // paired egress of a relay can recover it; the session's peer fd
            // wins when it is already known.
            (Direction::Ingress, MessageType::Response) => {
                let id = next_id();
                let peer_fd = if socket.peer_fd != 0 { socket.peer_fd } else { fd };
                TraceDecision::plain(
                    id,
                    keep_data_seq,
                    TraceOp::Put(PendingTrace {
                        thread_trace_id: id,
                        socket_id,
                        peer_fd,
                    }),
                )
            }
            (Direction::Egress, _) => {
                // A speculative relay session may hold a parked id from the
                // socket() that created the fd.
                let parked = socket.trace_id;
                TraceDecision {
                    thread_trace_id: parked,
                    keep_data_seq,
                    op: TraceOp::None,
                    consume_parked: parked != 0,
                }
            }
            _ => TraceDecision::plain(0, keep_data_seq, TraceOp::None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket() -> SocketInfo {
        SocketInfo::zeroed()
    }

    fn counter(start: u64) -> impl FnMut() -> u64 {
        let mut next = start;
        move || {
            next += 1;
            next
        }
    }

    fn trace(id: u64, socket_id: u64, peer_fd: u32) -> TraceInfo {
        TraceInfo {
            thread_trace_id: id,
            socket_id,
            update_time: 0,
            peer_fd,
            _pad: 0,
        }
    }

    #[test]
    fn ingress_request_opens_trace() {
        let d = trace_transition(
            Direction::Ingress,
            MessageType::Request,
            None,
            &socket(),
            100,
            5,
            false,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 1);
        assert_eq!(
            d.op,
            TraceOp::Put(PendingTrace {
                thread_trace_id: 1,
                socket_id: 100,
                peer_fd: 5,
            })
        );
        assert!(!d.keep_data_seq);
    }

    #[test]
    fn client_request_response_pair_on_one_socket() {
        // Egress request opens; the ingress response on the same socket
        // closes with the same id.
        let req = trace_transition(
            Direction::Egress,
            MessageType::Request,
            None,
            &socket(),
            100,
            5,
            false,
            counter(10),
        );
        assert_eq!(req.thread_trace_id, 11);
        let TraceOp::Put(pending) = req.op else {
            panic!("request should open a trace");
        };

        let stored = trace(pending.thread_trace_id, pending.socket_id, pending.peer_fd);
        let mut s = socket();
        s.direction = Direction::Egress as u8;
        s.msg_type = MessageType::Request as u8;
        let resp = trace_transition(
            Direction::Ingress,
            MessageType::Response,
            Some(&stored),
            &s,
            100,
            5,
            false,
            counter(20),
        );
        assert_eq!(resp.thread_trace_id, 11);
        assert_eq!(resp.op, TraceOp::Delete);
    }

    #[test]
    fn egress_on_other_socket_consumes_trace() {
        let prior = trace(42, 100, 5);
        let d = trace_transition(
            Direction::Egress,
            MessageType::Request,
            Some(&prior),
            &socket(),
            200,
            9,
            false,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 42);
        assert_eq!(d.op, TraceOp::Delete);
    }

    #[test]
    fn egress_on_same_socket_does_not_cross_link() {
        let prior = trace(42, 100, 5);
        let d = trace_transition(
            Direction::Egress,
            MessageType::Response,
            Some(&prior),
            &socket(),
            100,
            5,
            false,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 0);
        assert_eq!(d.op, TraceOp::Delete);
    }

    #[test]
    fn egress_response_without_trace_is_zero() {
        let d = trace_transition(
            Direction::Egress,
            MessageType::Response,
            None,
            &socket(),
            100,
            5,
            false,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 0);
        assert_eq!(d.op, TraceOp::None);
        assert!(!d.consume_parked);
    }

    #[test]
    fn egress_consumes_parked_relay_id() {
        let mut s = socket();
        s.trace_id = 77;
        let d = trace_transition(
            Direction::Egress,
            MessageType::Response,
            None,
            &s,
            100,
            9,
            false,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 77);
        assert!(d.consume_parked);
    }

    #[test]
    fn aligned_ingress_burst_reuses_id_and_seq() {
        let prior = trace(42, 100, 5);
        let mut s = socket();
        s.direction = Direction::Ingress as u8;
        s.msg_type = MessageType::Request as u8;
        let d = trace_transition(
            Direction::Ingress,
            MessageType::Request,
            Some(&prior),
            &s,
            100,
            5,
            false,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 42);
        assert!(d.keep_data_seq);
        assert_eq!(d.op, TraceOp::None);
    }

    #[test]
    fn relay_forwarding_carries_the_ingress_id() {
        // Server half of an L4 relay: ingress request on fd A opens, the
        // forwarded egress request on fd B (a different session) closes with
        // the same id.
        let req = trace_transition(
            Direction::Ingress,
            MessageType::Request,
            None,
            &socket(),
            100,
            5,
            false,
            counter(0),
        );
        let TraceOp::Put(pending) = req.op else {
            panic!("request should open a trace");
        };
        let stored = trace(pending.thread_trace_id, pending.socket_id, pending.peer_fd);

        let fwd = trace_transition(
            Direction::Egress,
            MessageType::Request,
            Some(&stored),
            &socket(),
            200,
            9,
            false,
            counter(50),
        );
        assert_eq!(fwd.thread_trace_id, req.thread_trace_id);
        assert_eq!(fwd.op, TraceOp::Delete);
    }

    #[test]
    fn ingress_response_without_trace_uses_session_peer_fd() {
        let mut s = socket();
        s.peer_fd = 11;
        let d = trace_transition(
            Direction::Ingress,
            MessageType::Response,
            None,
            &s,
            100,
            5,
            false,
            counter(9),
        );
        assert!(d.thread_trace_id != 0);
        match d.op {
            TraceOp::Put(p) => assert_eq!(p.peer_fd, 11),
            other => panic!("expected put, got {other:?}"),
        }
    }

    #[test]
    fn go_process_gets_zero_trace_id() {
        let d = trace_transition(
            Direction::Ingress,
            MessageType::Request,
            None,
            &socket(),
            100,
            5,
            true,
            counter(0),
        );
        assert_eq!(d.thread_trace_id, 0);
        assert_eq!(d.op, TraceOp::None);
    }
}
