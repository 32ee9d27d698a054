use std::collections::HashSet;

use super::DeviceIdentity;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub appeared: HashSet<DeviceIdentity>,
    pub vanished: HashSet<DeviceIdentity>,
}

/// Devices present in `current` but not `previous`, and the reverse.
///
/// An empty `previous` reports every current device as appeared; suppressing
/// that at startup is the caller's job.
pub fn diff(previous: &HashSet<DeviceIdentity>, current: &HashSet<DeviceIdentity>) -> SnapshotDiff {
    SnapshotDiff {
        appeared: current.difference(previous).cloned().collect(),
        vanished: previous.difference(current).cloned().collect(),
    }
}
