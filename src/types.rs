//! Shared identifiers, command kinds, claim tokens and the status record.

use std::fmt;

use crate::error::QueueError;

/// Unique identifier for a submitted command.
pub type CommandId = u64;
/// Unique identifier for a consumer handle.
pub type ConsumerId = u64;
/// Unique identifier for a claim; never reused within a queue.
pub type ClaimId = u64;

/// Closed set of commands a producer may submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CommandKind {
    Ping = 1,
    Reboot = 2,
    BoostEnable = 3,
    BoostDisable = 4,
}

impl CommandKind {
    /// Every valid kind, in code order.
    pub const ALL: [CommandKind; 4] = [
        CommandKind::Ping,
        CommandKind::Reboot,
        CommandKind::BoostEnable,
        CommandKind::BoostDisable,
    ];

    /// Raw code used by untyped callers.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::Reboot => "reboot",
            CommandKind::BoostEnable => "boost-enable",
            CommandKind::BoostDisable => "boost-disable",
        }
    }
}

impl TryFrom<i32> for CommandKind {
    type Error = QueueError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(QueueError::InvalidKind(code))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Proof that a consumer currently holds one taken-but-unfinished command.
///
/// A claim is plain data: holding a copy does not grant anything by itself.
/// The consumer that issued it checks every `finish` against its own slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Claim {
    id: ClaimId,
    consumer: ConsumerId,
    command: CommandId,
    kind: CommandKind,
}

impl Claim {
    pub(crate) fn new(
        id: ClaimId,
        consumer: ConsumerId,
        command: CommandId,
        kind: CommandKind,
    ) -> Self {
        Self {
            id,
            consumer,
            command,
            kind,
        }
    }

    pub fn id(&self) -> ClaimId {
        self.id
    }

    /// Consumer that issued this claim.
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Command this claim refers to.
    pub fn command(&self) -> CommandId {
        self.command
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }
}

/// Orbital telemetry block nested in the status record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub latitude: f32,
    pub longitude: f32,
    /// Altitude in meters.
    pub altitude: i32,
    pub velocity: f32,
    pub inclination: f32,
    /// Orbital period in minutes.
    pub period: f32,
}

/// The single shared status record, always transferred whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusRecord {
    pub name: String,
    /// Wall-clock seconds at the time of the report.
    pub time: i32,
    pub uptime: i32,
    pub signal: i32,
    /// Link latency in milliseconds.
    pub latency: i32,
    pub boost: bool,
    pub telemetry: Telemetry,
}

impl StatusRecord {
    /// Status with the given name and every other field zeroed.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_for_every_kind() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::try_from(kind.code()), Ok(kind));
        }
    }

    #[test]
    fn codes_outside_the_set_are_rejected() {
        for code in [0, 5, -1, i32::MAX] {
            assert_eq!(
                CommandKind::try_from(code),
                Err(QueueError::InvalidKind(code))
            );
        }
    }

    #[test]
    fn display_uses_short_names() {
        assert_eq!(CommandKind::BoostEnable.to_string(), "boost-enable");
        assert_eq!(CommandKind::Ping.to_string(), "ping");
    }
}
