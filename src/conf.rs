//! This module defines types used to configure the session core and its
//! parts.

use std::{path::PathBuf, time::Duration};

/// The global configuration for the session core and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub session: SessionConf,
    pub tracker: TrackerConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for
    /// `profiles_dir`, which is not sensible to guess for the user.
    pub fn new(profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            session: SessionConf::default(),
            tracker: TrackerConf::new(profiles_dir),
        }
    }
}

/// Configuration related to the listening engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The local TCP port to listen on for incoming peer sessions.
    pub port: u16,
    /// `auto`, or an explicit externally-reachable `host:port`, used when
    /// announcing ourselves to the tracker.
    pub external_address: ExternalAddress,
    /// Max accepted inbound connections per second (spec §4.9).
    pub accept_rate_limit: u32,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            port: 8941,
            external_address: ExternalAddress::Auto,
            accept_rate_limit: 4,
        }
    }
}

/// The `external_address` configuration key: either resolved automatically
/// (e.g. via a NAT port mapping helper, out of scope here) or pinned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalAddress {
    Auto,
    Fixed(String),
}

/// Configuration for a single peer session's timeouts (spec §5, §6).
#[derive(Clone, Copy, Debug)]
pub struct SessionConf {
    /// `tpot_timeout`: deadline during handshake.
    pub handshake_timeout: Duration,
    /// `tpot_read_timeout`: deadline on established sessions.
    pub read_timeout: Duration,
    /// `request_timeout`: deadline for a request to collect all responses.
    pub request_timeout: Duration,
    /// `meeting_timeout`: deadline for a rendezvous meeting-point step.
    pub meeting_timeout: Duration,
    /// The default I/O chunk size used by the sender scheduler (spec §4.8).
    pub chunk_size: usize,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            meeting_timeout: Duration::from_secs(30),
            chunk_size: 4096,
        }
    }
}

impl SessionConf {
    /// `min(meeting_timeout/3, request_timeout)`, the deadline used for
    /// each individual rendezvous meeting-point step (spec §4.6).
    pub fn meeting_step_timeout(&self) -> Duration {
        std::cmp::min(self.meeting_timeout / 3, self.request_timeout)
    }
}

/// Configuration related to tracker discovery.
#[derive(Clone, Debug)]
pub struct TrackerConf {
    /// `tracker_port`: the port our own embedded tracker (if any) listens
    /// on. Publishing/querying a remote tracker uses `tracker_host` below.
    pub tracker_port: u16,
    /// `interface_port`: the port the (out of scope) HTTP user interface
    /// listens on. Kept here only because it is a recognized config key.
    pub interface_port: u16,
    /// `tracker`: hostname of the tracker to publish to and query.
    pub tracker_host: String,
    /// `profiles_dir`: directory holding per-profile state.
    pub profiles_dir: PathBuf,
    /// How often the engine re-announces to the tracker.
    pub announce_interval: Duration,
}

impl TrackerConf {
    pub fn new(profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracker_port: 8942,
            interface_port: 8080,
            tracker_host: "tracker.teapotnet.org".to_string(),
            profiles_dir: profiles_dir.into(),
            announce_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meeting_step_timeout_is_the_smaller_bound() {
        let mut conf = SessionConf::default();
        conf.meeting_timeout = Duration::from_secs(9);
        conf.request_timeout = Duration::from_secs(100);
        assert_eq!(conf.meeting_step_timeout(), Duration::from_secs(3));

        conf.meeting_timeout = Duration::from_secs(300);
        conf.request_timeout = Duration::from_secs(5);
        assert_eq!(conf.meeting_step_timeout(), Duration::from_secs(5));
    }
}
