//! Connection state of one side of a simulated stream link.
//!
//! Each node keeps one [`LinkState`] per peer and transport. The state folds
//! three flags into a single value:
//!
//! | state            | local error | remote error | open |
//! |------------------|-------------|--------------|------|
//! | `Closed`         | 0           | 0            | 0    |
//! | `Open`           | 0           | 0            | 1    |
//! | `ErrorQueued`    | 1           | 0            | 0    |
//! | `ErrorSignalled` | 0           | 1            | 1    |
//! | `ReadError`      | 1           | 1            | 1    |
//!
//! "Local error" means a `READ_ERROR` pseudo-message sits at the head of this
//! side's queue toward the peer; "remote error" means the peer has been told
//! of an error and this side waits for the peer's `READ_ERROR` to arrive.
//! No other flag combination is representable. Transitions go through
//! [`LinkState::transition`]; an input that is illegal in the current state
//! yields `None` and is reported as a violation by the transport.

use std::fmt;

/// State of one side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// No traffic since the last reset.
    #[default]
    Closed,
    /// Messages have been exchanged.
    Open,
    /// This side reset and queued a `READ_ERROR` toward the peer.
    ErrorQueued,
    /// The peer reset; this side waits for its `READ_ERROR`.
    ErrorSignalled,
    /// A read error hit both directions; both sides hold a queued error.
    ReadError,
}

/// Inputs of the link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkInput {
    /// A data message was exchanged.
    Opened,
    /// A simulated read error hit both directions.
    BidiReadError,
    /// The peer reset while the link was up.
    SourceReset,
    /// This side's queued `READ_ERROR` was consumed by the peer.
    ErrorDequeued,
    /// The peer's `READ_ERROR` reached this side.
    ErrorReceived,
}

/// What the transport must do to its queue when its node resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetAction {
    /// Send `SOURCE_RESET` to the peer.
    pub notify_peer: bool,
    /// Queue a `READ_ERROR` at the head of the queue.
    pub queue_error: bool,
}

impl LinkState {
    /// `(local_error, remote_error, open)`.
    pub fn flags(self) -> (bool, bool, bool) {
        match self {
            LinkState::Closed => (false, false, false),
            LinkState::Open => (false, false, true),
            LinkState::ErrorQueued => (true, false, false),
            LinkState::ErrorSignalled => (false, true, true),
            LinkState::ReadError => (true, true, true),
        }
    }

    pub fn local_error(self) -> bool {
        self.flags().0
    }

    pub fn remote_error(self) -> bool {
        self.flags().1
    }

    pub fn is_open(self) -> bool {
        self.flags().2
    }

    /// Whether either error flag is set.
    pub fn has_error(self) -> bool {
        self.local_error() || self.remote_error()
    }

    /// Whether the head of this side's queue may be delivered.
    ///
    /// Data waits while the peer has been told of an error and this side has
    /// no error of its own to deliver first.
    pub fn can_deliver(self) -> bool {
        self.local_error() || !self.remote_error()
    }

    /// Next state, or `None` if `input` is illegal here.
    pub fn transition(self, input: LinkInput) -> Option<LinkState> {
        use LinkInput as I;
        use LinkState as S;
        match (self, input) {
            (S::Closed | S::Open, I::Opened) => Some(S::Open),
            (S::ErrorSignalled | S::ReadError, I::Opened) => Some(self),

            (S::Open, I::BidiReadError) => Some(S::ReadError),

            (S::Open, I::SourceReset) => Some(S::ErrorSignalled),
            (S::ErrorQueued, I::SourceReset) => Some(S::Closed),
            (S::ReadError, I::SourceReset) => Some(S::ErrorSignalled),

            (S::ErrorQueued, I::ErrorDequeued) => Some(S::Closed),
            (S::ReadError, I::ErrorDequeued) => Some(S::ErrorSignalled),

            (S::ErrorSignalled, I::ErrorReceived) => Some(S::Closed),
            (S::ReadError, I::ErrorReceived) => Some(S::ErrorQueued),

            _ => None,
        }
    }

    /// Reconciled state after this side's node resets, and what the
    /// transport must do to reach it.
    pub fn after_reset(self) -> (LinkState, ResetAction) {
        match self {
            LinkState::Open => (
                LinkState::ErrorQueued,
                ResetAction {
                    notify_peer: true,
                    queue_error: true,
                },
            ),
            LinkState::ReadError => (
                LinkState::ErrorQueued,
                ResetAction {
                    notify_peer: true,
                    ..ResetAction::default()
                },
            ),
            LinkState::ErrorSignalled => (
                LinkState::Closed,
                ResetAction {
                    notify_peer: true,
                    ..ResetAction::default()
                },
            ),
            LinkState::ErrorQueued | LinkState::Closed => (self, ResetAction::default()),
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (l, r, o) = self.flags();
        write!(f, "{},{},{}", l as u8, r as u8, o as u8)
    }
}

/// One side of a link as seen by the consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSide {
    pub state: LinkState,
    pub dest_not_ready: bool,
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.state, self.dest_not_ready as u8)
    }
}

/// Whether two states may face each other across a link.
pub fn is_consistent_pair(a: LinkState, b: LinkState) -> bool {
    use LinkState as S;
    matches!(
        (a, b),
        (S::Closed, S::Closed)
            | (S::Open, S::Open)
            | (S::ErrorQueued, S::ErrorSignalled)
            | (S::ErrorSignalled, S::ErrorQueued)
            | (S::ReadError, S::ReadError)
    )
}

/// Check both sides of a link, including pending dest-not-ready notices.
///
/// A notice may only be pending on a closed, error-free link, and never on
/// both sides at once.
pub fn check_link_pair(a: LinkSide, b: LinkSide) -> Result<(), String> {
    let invalid = || Err(format!("invalid socket state (l,r,o,p): {a},{b}"));
    if !is_consistent_pair(a.state, b.state) {
        return invalid();
    }
    let any_dnr = a.dest_not_ready || b.dest_not_ready;
    if any_dnr && (a.state != LinkState::Closed || b.state != LinkState::Closed) {
        return invalid();
    }
    if a.dest_not_ready && b.dest_not_ready {
        return invalid();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LinkState; 5] = [
        LinkState::Closed,
        LinkState::Open,
        LinkState::ErrorQueued,
        LinkState::ErrorSignalled,
        LinkState::ReadError,
    ];

    fn side(state: LinkState) -> LinkSide {
        LinkSide {
            state,
            dest_not_ready: false,
        }
    }

    #[test]
    fn test_legal_flag_combinations() {
        let flags: Vec<_> = ALL.iter().map(|s| s.flags()).collect();
        assert_eq!(
            flags,
            vec![
                (false, false, false),
                (false, false, true),
                (true, false, false),
                (false, true, true),
                (true, true, true),
            ]
        );
    }

    #[test]
    fn test_consistent_pairs_match_symmetry_table() {
        let mut legal = Vec::new();
        for a in ALL {
            for b in ALL {
                if is_consistent_pair(a, b) {
                    legal.push((a.to_string(), b.to_string()));
                }
            }
        }
        let expected: Vec<(String, String)> = [
            ("0,0,0", "0,0,0"),
            ("0,0,1", "0,0,1"),
            ("1,0,0", "0,1,1"),
            ("0,1,1", "1,0,0"),
            ("1,1,1", "1,1,1"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();
        assert_eq!(legal.len(), expected.len());
        for pair in expected {
            assert!(legal.contains(&pair), "missing {pair:?}");
        }
    }

    #[test]
    fn test_reset_of_open_link() {
        let (state, action) = LinkState::Open.after_reset();
        assert_eq!(state, LinkState::ErrorQueued);
        assert!(!state.is_open());
        assert!(action.notify_peer);
        assert!(action.queue_error);

        // The peer hears SOURCE_RESET and the pair stays consistent.
        let peer = LinkState::Open.transition(LinkInput::SourceReset).unwrap();
        assert!(is_consistent_pair(state, peer));
    }

    #[test]
    fn test_reset_keeps_every_consistent_pair_consistent() {
        for a in ALL {
            for b in ALL {
                if !is_consistent_pair(a, b) {
                    continue;
                }
                let (a2, action) = a.after_reset();
                let b2 = if action.notify_peer {
                    b.transition(LinkInput::SourceReset).unwrap()
                } else {
                    b
                };
                assert!(is_consistent_pair(a2, b2), "{a} / {b} -> {a2} / {b2}");
            }
        }
    }

    #[test]
    fn test_bidi_error_lifecycle() {
        // Both sides open, a read error hits both directions.
        let a = LinkState::Open.transition(LinkInput::BidiReadError).unwrap();
        let b = LinkState::Open.transition(LinkInput::BidiReadError).unwrap();
        assert_eq!((a, b), (LinkState::ReadError, LinkState::ReadError));

        // a's error is consumed and delivered to b.
        let a = a.transition(LinkInput::ErrorDequeued).unwrap();
        let b = b.transition(LinkInput::ErrorReceived).unwrap();
        assert!(is_consistent_pair(a, b));

        // b's error is consumed and delivered to a.
        let b = b.transition(LinkInput::ErrorDequeued).unwrap();
        let a = a.transition(LinkInput::ErrorReceived).unwrap();
        assert_eq!((a, b), (LinkState::Closed, LinkState::Closed));
    }

    #[test]
    fn test_illegal_inputs_are_rejected() {
        assert_eq!(LinkState::Closed.transition(LinkInput::SourceReset), None);
        assert_eq!(LinkState::Closed.transition(LinkInput::BidiReadError), None);
        assert_eq!(LinkState::ErrorQueued.transition(LinkInput::Opened), None);
        assert_eq!(LinkState::Open.transition(LinkInput::ErrorReceived), None);
    }

    #[test]
    fn test_dest_not_ready_rules() {
        let dnr = LinkSide {
            state: LinkState::Closed,
            dest_not_ready: true,
        };
        assert!(check_link_pair(dnr, side(LinkState::Closed)).is_ok());
        assert!(check_link_pair(dnr, dnr).is_err());
        let open_dnr = LinkSide {
            state: LinkState::Open,
            dest_not_ready: true,
        };
        assert!(check_link_pair(open_dnr, side(LinkState::Open)).is_err());
        assert!(check_link_pair(side(LinkState::Open), side(LinkState::Closed)).is_err());
    }
}
