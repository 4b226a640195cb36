//! The named gates that drive the rendezvous.
//!
//! ```text
//!            owner                          peer
//!   post owner_ready  ───────────────▶  wait owner_ready
//!   wait peer_ready   ◀───────────────  post peer_ready
//!          [ increments, each under mutex ]
//!   post owner_done   ───────────────▶  wait owner_done
//!   wait peer_done    ◀───────────────  post peer_done
//! ```
//!
//! That is the [`Shape::Directional`] layout. [`Shape::Shared`] keeps only a
//! single "start" gate (posted by the peer) and a single "done" gate (posted
//! by the owner), so only one side ever waits on each.

use serde::{Deserialize, Serialize};

use crate::error::TandemError;
use crate::ipc::name::NameError;
use crate::ipc::sem::NamedSemaphore;
use crate::ipc::{Creator, IpcName, Opener, Ownership};
use crate::protocol::Role;
use crate::trace::debug;

/// Gate layout and waiting discipline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// Ready and done gates per direction; both sides wait for each other.
    #[default]
    Directional,
    /// One shared start gate and one shared done gate. The owner never waits
    /// for the peer to finish, so its final count is only a lower bound.
    Shared,
}

/// Identifies one gate of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Mutex,
    OwnerReady,
    OwnerDone,
    PeerReady,
    PeerDone,
}

impl Gate {
    pub const ALL: [Gate; 5] = [
        Gate::Mutex,
        Gate::OwnerReady,
        Gate::OwnerDone,
        Gate::PeerReady,
        Gate::PeerDone,
    ];

    const fn suffix(self) -> &'static str {
        match self {
            Gate::Mutex => "mutex",
            Gate::OwnerReady => "owner_ready",
            Gate::OwnerDone => "owner_done",
            Gate::PeerReady => "peer_ready",
            Gate::PeerDone => "peer_done",
        }
    }

    /// Initial permit count when the owner creates the gate.
    const fn initial(self) -> u32 {
        match self {
            Gate::Mutex => 1,
            _ => 0,
        }
    }

    const fn ready_of(role: Role) -> Gate {
        match role {
            Role::Owner => Gate::OwnerReady,
            Role::Peer => Gate::PeerReady,
        }
    }

    const fn done_of(role: Role) -> Gate {
        match role {
            Role::Owner => Gate::OwnerDone,
            Role::Peer => Gate::PeerDone,
        }
    }

    /// Gates a shape actually uses.
    #[must_use]
    pub fn used_by(shape: Shape) -> &'static [Gate] {
        match shape {
            Shape::Directional => &Gate::ALL,
            // "start" is posted by the peer, "done" by the owner
            Shape::Shared => &[Gate::Mutex, Gate::PeerReady, Gate::OwnerDone],
        }
    }
}

/// Well-known semaphore names, derived from the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateNames {
    names: [IpcName; 5],
}

impl GateNames {
    pub fn with_prefix(prefix: &str) -> Result<Self, NameError> {
        let name = |gate: Gate| IpcName::new(format!("/{prefix}_{}", gate.suffix()));
        Ok(Self {
            names: [
                name(Gate::Mutex)?,
                name(Gate::OwnerReady)?,
                name(Gate::OwnerDone)?,
                name(Gate::PeerReady)?,
                name(Gate::PeerDone)?,
            ],
        })
    }

    #[must_use]
    pub fn get(&self, gate: Gate) -> &IpcName {
        &self.names[gate as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gate, &IpcName)> {
        Gate::ALL.into_iter().zip(self.names.iter())
    }
}

/// Which gates a participant posts and waits on, by phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePlan {
    /// Posted once on `Initializing → Announced`.
    pub announce: Option<Gate>,
    /// Waited on before the first increment.
    pub await_ready: Option<Gate>,
    /// Posted after the last increment.
    pub signal_done: Option<Gate>,
    /// Waited on before the final read of the counter.
    pub await_done: Option<Gate>,
}

impl GatePlan {
    #[must_use]
    pub const fn for_role(shape: Shape, role: Role) -> Self {
        match shape {
            Shape::Directional => Self {
                announce: Some(Gate::ready_of(role)),
                await_ready: Some(Gate::ready_of(role.other())),
                signal_done: Some(Gate::done_of(role)),
                await_done: Some(Gate::done_of(role.other())),
            },
            Shape::Shared => match role {
                Role::Owner => Self {
                    announce: None,
                    await_ready: Some(Gate::PeerReady),
                    signal_done: Some(Gate::OwnerDone),
                    await_done: None,
                },
                Role::Peer => Self {
                    announce: Some(Gate::PeerReady),
                    await_ready: None,
                    signal_done: None,
                    await_done: Some(Gate::OwnerDone),
                },
            },
        }
    }

    /// Whether the counter read at the end follows the other side's completion.
    #[must_use]
    pub const fn observes_peer_completion(&self) -> bool {
        self.await_done.is_some()
    }
}

/// Handles to every gate a shape uses, all with the same ownership mode.
pub struct GateSet<Mode: Ownership> {
    gates: [Option<NamedSemaphore<Mode>>; 5],
}

impl GateSet<Creator> {
    /// Creates every gate `shape` needs, exclusively.
    ///
    /// If one creation fails the gates created so far are dropped, which
    /// unlinks them again.
    pub fn create(names: &GateNames, shape: Shape) -> Result<Self, TandemError> {
        let mut gates: [Option<NamedSemaphore<Creator>>; 5] = Default::default();
        for &gate in Gate::used_by(shape) {
            let sem = NamedSemaphore::<Creator>::create(names.get(gate), gate.initial())?;
            gates[gate as usize] = Some(sem);
        }
        debug!(?shape, "gates created");
        Ok(Self { gates })
    }
}

impl GateSet<Opener> {
    /// Opens every gate `shape` needs. `ENOENT` on any of them means the owner
    /// has not finished creating the set.
    pub fn open(names: &GateNames, shape: Shape) -> Result<Self, TandemError> {
        let mut gates: [Option<NamedSemaphore<Opener>>; 5] = Default::default();
        for &gate in Gate::used_by(shape) {
            gates[gate as usize] = Some(NamedSemaphore::<Opener>::open(names.get(gate))?);
        }
        debug!(?shape, "gates opened");
        Ok(Self { gates })
    }
}

impl<Mode: Ownership> GateSet<Mode> {
    /// Handle for `gate`, if the shape uses it.
    #[must_use]
    pub fn get(&self, gate: Gate) -> Option<&NamedSemaphore<Mode>> {
        self.gates[gate as usize].as_ref()
    }

    /// Handle for `gate`, or a setup failure if the shape does not include it.
    pub fn require(&self, gate: Gate) -> Result<&NamedSemaphore<Mode>, TandemError> {
        self.get(gate).ok_or_else(|| TandemError::SetupFailure {
            resource: crate::error::Resource::Gate,
            name: gate.suffix().to_string(),
            reason: "gate not part of this shape".to_string(),
        })
    }
}
