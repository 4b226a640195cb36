//! The two-party counter protocol.
//!
//! Each participant drives one [`Session`] through four phases:
//!
//! ```text
//! Initializing ──announce──▶ Announced ──await ready──▶ CounterPhase ──quota done──▶ Finished
//! ```
//!
//! The owner builds its session with [`Session::establish_owner`], which
//! creates the segment and every gate. The peer uses [`Session::attach_peer`],
//! which only opens them. Whatever happens, dropping a session releases its
//! handles, and the owner's release also unlinks every name.

use std::fmt;
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::config::Config;
use crate::error::{Resource, TandemError};
use crate::gates::{Gate, GatePlan, GateSet, Shape};
use crate::ipc::shmem::Shm;
use crate::ipc::{Creator, Opener, Ownership};
use crate::segment::SharedCounter;
use crate::signal::Shutdown;
use crate::trace::{debug, error, info, warn};
use crate::wait::{WaitError, wait_gate};

/// Pause between attach attempts while the owner is still setting up.
const ATTACH_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates and removes every named resource.
    Owner,
    /// Opens the owner's resources by name.
    Peer,
}

impl Role {
    #[must_use]
    pub const fn other(self) -> Role {
        match self {
            Role::Owner => Role::Peer,
            Role::Peer => Role::Owner,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Peer => "peer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a participant is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Initializing,
    Announced,
    CounterPhase,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Initializing => "initializing",
            Phase::Announced => "announced",
            Phase::CounterPhase => "counter phase",
            Phase::Finished => "finished",
        })
    }
}

/// Outcome of a completed run, as seen by one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub role: Role,
    pub shape: Shape,
    /// Counter value read after the done handshake.
    pub observed: u64,
    /// `2 * quota`.
    pub expected: u64,
    /// Counter value read just before this side posted its ready gate.
    pub counter_at_announce: u64,
    /// Whether `observed` was read after the other side finished. When
    /// `false` the value is only a lower bound.
    pub authoritative: bool,
}

impl Report {
    #[must_use]
    pub const fn is_correct(&self) -> bool {
        self.observed == self.expected
    }

    /// `0` on success, `5` when an authoritative count is wrong.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.authoritative && !self.is_correct() {
            5
        } else {
            0
        }
    }

    fn verdict(&self) -> &'static str {
        match (self.is_correct(), self.authoritative) {
            (true, _) => "CORRECT",
            (false, true) => "NOT CORRECT",
            (false, false) => "(lower bound) peer may still be running",
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reports final counter value = {:>10} Expecting: {:>10} {}",
            self.role,
            self.observed,
            self.expected,
            self.verdict()
        )
    }
}

/// One participant's view of a run: its role, configuration, shutdown flag,
/// and its own handles to the segment and gates.
pub struct Session<'a, Mode: Ownership> {
    role: Role,
    config: Config,
    shutdown: Shutdown<'a>,
    plan: GatePlan,
    phase: Phase,
    segment: Option<Shm<SharedCounter, Mode>>,
    gates: Option<GateSet<Mode>>,
    counter_at_announce: Option<u64>,
}

impl<'a> Session<'a, Creator> {
    /// Creates the segment, then every gate the configured shape needs.
    ///
    /// Fails with [`TandemError::ResourceAlreadyExists`] if any name is still
    /// bound from an earlier run. Nothing created here survives a failure.
    pub fn establish_owner(config: Config, shutdown: Shutdown<'a>) -> Result<Self, TandemError> {
        config.validate()?;
        let segment_name = config.segment_name()?;
        let names = config.gate_names()?;

        if shutdown.requested() {
            return Err(TandemError::Interrupted {
                phase: Phase::Initializing,
            });
        }

        let segment = Shm::<SharedCounter, Creator>::create(&segment_name)?;
        // gates last: once they exist the segment is fully initialized
        let gates = GateSet::<Creator>::create(&names, config.shape)?;

        info!(
            segment = %segment_name,
            shape = ?config.shape,
            quota = config.quota,
            "owner established resources"
        );
        Ok(Self::new(Role::Owner, config, shutdown, segment, gates))
    }
}

impl<'a> Session<'a, Opener> {
    /// Opens the owner's gates and segment by name.
    ///
    /// While any of them is missing the attempt is repeated until
    /// `attach_timeout` runs out; a timeout of zero makes a single attempt.
    /// A shutdown request ends the retry with [`TandemError::Interrupted`].
    pub fn attach_peer(config: Config, shutdown: Shutdown<'a>) -> Result<Self, TandemError> {
        config.validate()?;
        let deadline = Instant::now() + config.attach_timeout();
        let mut attempts = 0u32;

        loop {
            if shutdown.requested() {
                return Err(TandemError::Interrupted {
                    phase: Phase::Initializing,
                });
            }
            attempts += 1;

            match Self::try_attach(&config) {
                Ok((segment, gates)) => {
                    info!(attempts, shape = ?config.shape, "peer attached");
                    return Ok(Self::new(Role::Peer, config, shutdown, segment, gates));
                }
                Err(err @ TandemError::ResourceNotFound { .. }) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(err);
                    };
                    if remaining.is_zero() {
                        return Err(err);
                    }
                    debug!(attempts, error = %err, "owner not ready, retrying");
                    thread::sleep(ATTACH_BACKOFF.min(remaining));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_attach(
        config: &Config,
    ) -> Result<(Shm<SharedCounter, Opener>, GateSet<Opener>), TandemError> {
        // The owner creates the gates after the segment is sized and zeroed,
        // so opening them first rules out mapping a half-built segment.
        let gates = GateSet::<Opener>::open(&config.gate_names()?, config.shape)?;
        let segment = Shm::<SharedCounter, Opener>::open(&config.segment_name()?)?;
        Ok((segment, gates))
    }
}

impl<'a, Mode: Ownership> Session<'a, Mode> {
    fn new(
        role: Role,
        config: Config,
        shutdown: Shutdown<'a>,
        segment: Shm<SharedCounter, Mode>,
        gates: GateSet<Mode>,
    ) -> Self {
        Self {
            role,
            plan: GatePlan::for_role(config.shape, role),
            config,
            shutdown,
            phase: Phase::Initializing,
            segment: Some(segment),
            gates: Some(gates),
            counter_at_announce: None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The mapped segment, or `None` once the session has been released.
    #[must_use]
    pub fn segment(&self) -> Option<&SharedCounter> {
        self.segment.as_deref()
    }

    /// Runs every phase to completion and releases the session.
    pub fn run(mut self) -> Result<Report, TandemError> {
        self.announce()?;
        self.await_peer_ready()?;
        self.run_counter_phase()?;
        let report = self.finish()?;
        self.release();
        Ok(report)
    }

    /// `Initializing → Announced`: marks this side started and posts its
    /// ready gate. Calling it again is a no-op.
    pub fn announce(&mut self) -> Result<(), TandemError> {
        if self.phase != Phase::Initializing {
            return Ok(());
        }
        self.check_shutdown()?;

        let (segment, gates) = self.resources()?;
        let counter = segment.counter();
        segment.mark_started(self.role);
        if let Some(gate) = self.plan.announce {
            gates.require(gate)?.post()?;
            debug!(role = %self.role, ?gate, "ready posted");
        }

        self.counter_at_announce = Some(counter);
        self.phase = Phase::Announced;
        info!(role = %self.role, quota = self.config.quota, "announced");
        Ok(())
    }

    /// `Announced → CounterPhase`: blocks until the other side is ready, if
    /// this role waits for it.
    pub fn await_peer_ready(&mut self) -> Result<(), TandemError> {
        self.expect_phase(Phase::Announced)?;

        if let Some(gate) = self.plan.await_ready {
            debug!(role = %self.role, ?gate, "waiting for the other side");
            self.wait(gate)?;
        }

        self.phase = Phase::CounterPhase;
        info!(role = %self.role, "entering counter phase");
        Ok(())
    }

    /// Performs `quota` increments, each under the mutex gate.
    pub fn run_counter_phase(&mut self) -> Result<(), TandemError> {
        self.expect_phase(Phase::CounterPhase)?;

        for _ in 0..self.config.quota {
            self.check_shutdown()?;
            self.wait(Gate::Mutex)?;
            let (segment, gates) = self.resources()?;
            segment.increment_unguarded();
            gates.require(Gate::Mutex)?.post()?;
        }

        debug!(role = %self.role, increments = self.config.quota, "quota done");
        Ok(())
    }

    /// `CounterPhase → Finished`: marks this side done, posts its done gate,
    /// waits for the other side's if this role does, and reads the counter.
    pub fn finish(&mut self) -> Result<Report, TandemError> {
        self.expect_phase(Phase::CounterPhase)?;

        let (segment, gates) = self.resources()?;
        segment.mark_done(self.role);
        if let Some(gate) = self.plan.signal_done {
            gates.require(gate)?.post()?;
            debug!(role = %self.role, ?gate, "done posted");
        }
        if let Some(gate) = self.plan.await_done {
            debug!(role = %self.role, ?gate, "waiting for the other side to finish");
            self.wait(gate)?;
        }

        let (segment, _) = self.resources()?;
        if self.plan.observes_peer_completion() && !segment.is_done(self.role.other()) {
            warn!(role = %self.role, "done gate passed but the other side never marked done");
        }
        debug!(role = %self.role, snapshot = ?segment.snapshot(), "segment at finish");
        let report = Report {
            role: self.role,
            shape: self.config.shape,
            observed: segment.counter(),
            expected: self.config.expected_total(),
            counter_at_announce: self.counter_at_announce.unwrap_or_default(),
            authoritative: self.plan.observes_peer_completion(),
        };
        self.phase = Phase::Finished;

        if report.is_correct() || !report.authoritative {
            info!(role = %self.role, observed = report.observed, "finished");
        } else {
            warn!(
                role = %self.role,
                observed = report.observed,
                expected = report.expected,
                "final count does not match"
            );
        }
        Ok(report)
    }

    /// Closes every handle. For the owner this also unlinks the segment and
    /// gate names. Safe to call any number of times.
    pub fn release(&mut self) {
        let gates = self.gates.take();
        let segment = self.segment.take();
        if gates.is_none() && segment.is_none() {
            return;
        }
        drop(gates);
        drop(segment);
        info!(
            role = %self.role,
            phase = %self.phase,
            mode = Mode::LABEL,
            unlinked = Mode::SHOULD_UNLINK,
            "resources released"
        );
    }

    fn resources(&self) -> Result<(&SharedCounter, &GateSet<Mode>), TandemError> {
        match (&self.segment, &self.gates) {
            (Some(segment), Some(gates)) => Ok((&**segment, gates)),
            _ => Err(TandemError::SetupFailure {
                resource: Resource::Segment,
                name: self.role.to_string(),
                reason: "session already released".to_string(),
            }),
        }
    }

    fn wait(&self, gate: Gate) -> Result<(), TandemError> {
        let (_, gates) = self.resources()?;
        wait_gate(gates.require(gate)?, &self.shutdown).map_err(|err| match err {
            WaitError::Interrupted(_) => self.interrupted(),
            WaitError::Gate(err) => {
                error!(role = %self.role, ?gate, error = %err, "gate wait failed");
                err.into()
            }
        })
    }

    fn check_shutdown(&self) -> Result<(), TandemError> {
        if self.shutdown.requested() {
            return Err(self.interrupted());
        }
        Ok(())
    }

    fn interrupted(&self) -> TandemError {
        warn!(role = %self.role, phase = %self.phase, "shutdown requested");
        TandemError::Interrupted { phase: self.phase }
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), TandemError> {
        if self.phase == expected {
            return Ok(());
        }
        Err(TandemError::SetupFailure {
            resource: Resource::Segment,
            name: self.role.to_string(),
            reason: format!("expected phase {expected}, session is in {}", self.phase),
        })
    }
}

impl<Mode: Ownership> Drop for Session<'_, Mode> {
    fn drop(&mut self) {
        self.release();
    }
}
