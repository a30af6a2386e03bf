//! Demonstration protocols bundled with the binary.
//!
//! | Name    | Exercises                                          |
//! |---------|----------------------------------------------------|
//! | `ping`  | timers, request/response over stream transports    |
//! | `flood` | request-to-send, flush notifications, retry on error |

mod flood;
mod ping;

pub use flood::{Agreement, AllFlushed, FloodService, FloodTest};
pub use ping::{load_ping, EveryNodeAnswered, PingService, PongsMatchPings};

use pathcheck_simulation::{FnService, TestRegistry};

/// Registry of every bundled protocol.
pub fn default_registry() -> TestRegistry {
    TestRegistry::new()
        .with(FnService::new("ping", load_ping).with_description(
            "each node pings its successor until it hears a pong",
        ))
        .with(FloodTest::new(42))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = default_registry();
        let names: Vec<&str> = registry.names().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["ping", "flood"]);
        assert!(registry.names().all(|(_, desc)| !desc.is_empty()));
    }
}
