mod state;

use std::{fmt, num::ParseIntError, str::FromStr};

use derive_new::new;
use getset::{CopyGetters, Getters};
use rand::Rng;

pub use self::state::{Action, Event, SessionState, StateMachine};

/// Numeric identity this client registers with. Unique per process run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, new)]
pub struct ClientId(u32);

impl ClientId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(10..10000))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Clone, Debug, CopyGetters, Getters, new)]
pub struct Session {
    #[getset(get_copy = "pub")]
    client_id: ClientId,
    #[getset(get = "pub")]
    peer_id: String,
}
