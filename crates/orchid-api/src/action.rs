// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The closed vocabulary of generic VM actions.
//!
//! `vm.action` calls name one of these. Keeping the set closed (instead of
//! dispatching on raw strings) means the per-action tables in the core are
//! exhaustiveness-checked at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A generic VM action requested through `vm.action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmAction {
    /// Shut the VM down and remove it, releasing its resources.
    Terminate,
    /// Terminate without waiting for a guest shutdown.
    TerminateHard,
    /// Keep a pending VM from being scheduled.
    Hold,
    /// Return a held VM to the pending queue.
    Release,
    /// Stop the VM, saving state to the system datastore.
    Stop,
    /// Suspend the VM, keeping it on its host.
    Suspend,
    /// Resume a stopped, suspended, undeployed or powered-off VM.
    Resume,
    /// Reboot the guest gracefully.
    Reboot,
    /// Reset the guest without warning it.
    RebootHard,
    /// Power the VM off gracefully, keeping placement.
    Poweroff,
    /// Power the VM off immediately, keeping placement.
    PoweroffHard,
    /// Power off and free host resources, keeping the VM's disks.
    Undeploy,
    /// Undeploy without waiting for a guest shutdown.
    UndeployHard,
    /// Flag the VM for rescheduling.
    Resched,
    /// Clear the rescheduling flag.
    Unresched,
}

impl VmAction {
    /// The action's wire name, as accepted by `vm.action`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::TerminateHard => "terminate-hard",
            Self::Hold => "hold",
            Self::Release => "release",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Reboot => "reboot",
            Self::RebootHard => "reboot-hard",
            Self::Poweroff => "poweroff",
            Self::PoweroffHard => "poweroff-hard",
            Self::Undeploy => "undeploy",
            Self::UndeployHard => "undeploy-hard",
            Self::Resched => "resched",
            Self::Unresched => "unresched",
        }
    }

    /// All actions, in a stable order.
    pub fn all() -> &'static [VmAction] {
        &[
            Self::Terminate,
            Self::TerminateHard,
            Self::Hold,
            Self::Release,
            Self::Stop,
            Self::Suspend,
            Self::Resume,
            Self::Reboot,
            Self::RebootHard,
            Self::Poweroff,
            Self::PoweroffHard,
            Self::Undeploy,
            Self::UndeployHard,
            Self::Resched,
            Self::Unresched,
        ]
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an action name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown VM action '{}'", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for VmAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VmAction::all()
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_name_roundtrip() {
        for action in VmAction::all() {
            let parsed: VmAction = action.as_str().parse().unwrap();
            assert_eq!(*action, parsed);
        }
    }

    #[test]
    fn test_unknown_action() {
        let err = "defenestrate".parse::<VmAction>().unwrap_err();
        assert_eq!(err.to_string(), "unknown VM action 'defenestrate'");
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&VmAction::PoweroffHard).unwrap();
        assert_eq!(json, "\"poweroff-hard\"");
    }
}
