//! Prefixed ULID identifiers.
//!
//! Every public id in the runtime is a ULID behind a short type prefix
//! (`wrun_`, `step_`, `hook_`, `wait_`, `strm_`, `evt_`). ULIDs sort
//! lexicographically by creation time, so event and run listings come back in
//! chronological order without a separate sequence column.
//!
//! Ids generated *inside* workflow code must reproduce exactly on replay; the
//! [`IdSource`] is seeded from the run id and clocked from the event log so
//! that re-executing a workflow against the same events yields the same
//! correlation ids.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Error returned when parsing an id from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of id that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed id wrapper around a prefixed ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new id with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an id from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = s.strip_prefix(prefix_with_underscore).unwrap_or(s);

                Ulid::from_string(ulid_str).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Unique identifier for one execution (run) of a workflow.
    RunId,
    "wrun"
);

define_id!(
    /// Unique identifier for a persisted event.
    EventId,
    "evt"
);

define_id!(
    /// Unique identifier for a named byte stream.
    StreamId,
    "strm"
);

/// The durable-primitive family a correlation id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveFamily {
    /// A single step invocation.
    Step,
    /// A named mailbox awaited by the workflow.
    Hook,
    /// A durable delay with a concrete wake time.
    Wait,
}

impl PrimitiveFamily {
    /// Id prefix used for this family's correlation ids.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Hook => "hook",
            Self::Wait => "wait",
        }
    }
}

/// The id shared by all events pertaining to one primitive invocation.
///
/// Displayed as `step_<ulid>`, `hook_<ulid>` or `wait_<ulid>`; the prefix
/// encodes the family so the event log stays self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId {
    family: PrimitiveFamily,
    ulid: Ulid,
}

impl CorrelationId {
    /// Creates a step correlation id.
    #[must_use]
    pub const fn step(ulid: Ulid) -> Self {
        Self {
            family: PrimitiveFamily::Step,
            ulid,
        }
    }

    /// Creates a hook correlation id.
    #[must_use]
    pub const fn hook(ulid: Ulid) -> Self {
        Self {
            family: PrimitiveFamily::Hook,
            ulid,
        }
    }

    /// Creates a wait correlation id.
    #[must_use]
    pub const fn wait(ulid: Ulid) -> Self {
        Self {
            family: PrimitiveFamily::Wait,
            ulid,
        }
    }

    /// The family this correlation belongs to.
    #[must_use]
    pub const fn family(&self) -> PrimitiveFamily {
        self.family
    }

    /// The underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.family.prefix(), self.ulid)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, rest) = if let Some(rest) = s.strip_prefix("step_") {
            (PrimitiveFamily::Step, rest)
        } else if let Some(rest) = s.strip_prefix("hook_") {
            (PrimitiveFamily::Hook, rest)
        } else if let Some(rest) = s.strip_prefix("wait_") {
            (PrimitiveFamily::Wait, rest)
        } else {
            return Err(ParseIdError {
                id_type: "CorrelationId",
                reason: format!("unknown correlation prefix in {s:?}"),
            });
        };

        Ulid::from_string(rest)
            .map(|ulid| Self { family, ulid })
            .map_err(|e| ParseIdError {
                id_type: "CorrelationId",
                reason: e.to_string(),
            })
    }
}

impl Serialize for CorrelationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Deterministic id factory for replayed workflow code.
///
/// Seeded from the run id and clocked from the event log: the nth id produced
/// during a replay pass is identical across passes, so correlation ids
/// allocated by user code never drift between suspensions.
#[derive(Debug)]
pub struct IdSource {
    rng: StdRng,
    clock: DateTime<Utc>,
}

impl IdSource {
    /// Creates a factory seeded from the run id, with the clock initially at
    /// the run's creation time.
    #[must_use]
    pub fn seeded_for_run(run_id: &RunId, created_at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(run_id.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        Self {
            rng: StdRng::from_seed(seed),
            clock: created_at,
        }
    }

    /// Advance the replay clock. Called by the engine as events are consumed;
    /// `now()` inside workflow code observes this value.
    pub fn set_clock(&mut self, at: DateTime<Utc>) {
        self.clock = at;
    }

    /// The current replay clock.
    #[must_use]
    pub fn clock(&self) -> DateTime<Utc> {
        self.clock
    }

    fn next_ulid(&mut self) -> Ulid {
        let millis = self.clock.timestamp_millis().max(0) as u64;
        Ulid::from_parts(millis, self.rng.gen())
    }

    /// Allocates a correlation id for the given primitive family.
    pub fn correlation(&mut self, family: PrimitiveFamily) -> CorrelationId {
        let ulid = self.next_ulid();
        CorrelationId { family, ulid }
    }

    /// Allocates a stream id.
    pub fn stream_id(&mut self) -> StreamId {
        StreamId::from_ulid(self.next_ulid())
    }
}
