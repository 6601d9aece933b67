//! The Type-C connection manager.
//!
//! Debounces CC line conditions into attach, detach and role events, runs
//! the Try.SRC/Try.SNK role preference handshakes, detects audio and debug
//! accessories, and performs error recovery.
//!
//! Connection states follow the Type-C specification state diagram; all
//! debounce periods come from its timing table and are armed as timer
//! futures raced against CC line changes.
use core::marker::PhantomData;

use embassy_futures::join::join;
use embassy_futures::select::{Either, select};
use pdport_traits::{CcPin, CcPull, CcStatus, CcTermination, PowerControl, RpLevel, TypeCPhy};

use crate::config::{PortConfig, TryRole};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PortRole, PowerRole};

#[cfg(test)]
mod tests;

/// Connection states of the Type-C state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Port disabled, no terminations presented.
    Disabled,
    /// Error recovery: terminations removed for tErrorRecovery.
    ErrorRecovery,
    /// Unattached, presenting Rd.
    UnattachedSnk,
    /// Unattached, presenting Rp.
    UnattachedSrc,
    /// A source connection is being debounced.
    AttachWaitSnk,
    /// A sink connection is being debounced.
    AttachWaitSrc,
    /// Trying to resolve to the source role.
    TrySrc,
    /// Waiting as sink after an unsuccessful Try.SRC.
    TryWaitSnk,
    /// Trying to resolve to the sink role.
    TrySnk,
    /// Waiting as source after an unsuccessful Try.SNK.
    TryWaitSrc,
    /// Waiting for VBUS/VCONN discharge after a source detach.
    UnattachedWaitSrc,
    /// Attached as sink.
    AttachedSnk,
    /// Attached as source.
    AttachedSrc,
    /// An audio adapter accessory is attached (both lines Ra).
    AudioAccessory,
    /// A debug accessory is attached (both lines Rd/Rp).
    DebugAccessory,
}

/// The resolved outcome of an attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attachment {
    /// The resolved power role.
    pub power_role: PowerRole,
    /// The initial data role (DFP for sources, UFP for sinks).
    pub data_role: DataRole,
    /// The CC line the partner communicates on.
    pub orientation: CcPin,
    /// As sink: the Rp current advertisement seen at attach.
    pub sink_current: Option<RpLevel>,
    /// As source: the line carrying Ra, to be supplied with VCONN.
    pub vconn_line: Option<CcPin>,
}

/// What the connection manager resolved the connection to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Attached {
    /// A port partner, with this port acting as sink.
    Sink(Attachment),
    /// A port partner, with this port acting as source.
    Source(Attachment),
    /// An audio adapter accessory.
    AudioAccessory,
    /// A debug accessory.
    DebugAccessory,
}

/// Errors of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port is disabled and will not attach.
    PortDisabled,
}

/// The Type-C connection manager of one port.
#[derive(Debug)]
pub struct ConnectionManager<PHY: TypeCPhy, RAILS: PowerControl, TIMER: Timer> {
    phy: PHY,
    rails: RAILS,
    config: PortConfig,
    state: State,
    rp_level: RpLevel,
    _timer: PhantomData<TIMER>,
}

impl<PHY: TypeCPhy, RAILS: PowerControl, TIMER: Timer> ConnectionManager<PHY, RAILS, TIMER> {
    /// Create a new connection manager.
    pub fn new(phy: PHY, rails: RAILS, config: PortConfig) -> Self {
        let rp_level = config.default_rp;
        Self {
            phy,
            rails,
            config,
            state: State::Disabled,
            rp_level,
            _timer: PhantomData,
        }
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Disable the port: remove terminations and supplies.
    pub async fn disable(&mut self) {
        self.phy.set_cc_pull(CcPull::Open);
        self.rails.set_vbus(false).await;
        self.rails.set_vconn(CcPin::Cc1, false).await;
        self.rails.set_vconn(CcPin::Cc2, false).await;
        self.state = State::Disabled;
    }

    /// Force Type-C error recovery.
    pub fn trigger_error_recovery(&mut self) {
        self.state = State::ErrorRecovery;
    }

    /// Change the Rp level, reapplying it when currently presented.
    pub fn set_rp(&mut self, level: RpLevel) {
        self.rp_level = level;
        if matches!(
            self.state,
            State::UnattachedSrc | State::AttachWaitSrc | State::AttachedSrc | State::TrySrc | State::TryWaitSrc
        ) {
            self.phy.set_cc_pull(CcPull::Rp(level));
        }
    }

    /// Notify the manager that the attached partner was detached.
    ///
    /// Resets into the appropriate unattached state and removes supplies.
    pub async fn detached(&mut self) {
        match self.state {
            State::AttachedSrc => {
                self.state = State::UnattachedWaitSrc;
            }
            State::Disabled | State::ErrorRecovery => (),
            _ => {
                self.state = self.initial_unattached_state();
            }
        }
    }

    /// Wait for one CC line to remain in a state for the full debounce period.
    ///
    /// The debounce timer restarts whenever the monitored line changes;
    /// changes on the other line do not disturb it.
    async fn wait_line_stable(phy: &PHY, pin: CcPin, timer_type: TimerType) -> CcTermination {
        let mut status = phy.cc_status();

        loop {
            let timer = TimerType::get_timer::<TIMER>(timer_type);
            let line_change = async {
                let mut current = status;
                loop {
                    let next = phy.wait_for_cc_change(current).await;
                    if next.line(pin) != current.line(pin) {
                        return next;
                    }
                    current = next;
                }
            };

            match select(timer, line_change).await {
                Either::First(_) => return status.line(pin),
                Either::Second(next) => status = next,
            }
        }
    }

    /// Debounce both CC lines with independent per-line timers.
    async fn debounced_cc_status(&self, timer_type: TimerType) -> CcStatus {
        let (cc1, cc2) = join(
            Self::wait_line_stable(&self.phy, CcPin::Cc1, timer_type),
            Self::wait_line_stable(&self.phy, CcPin::Cc2, timer_type),
        )
        .await;

        CcStatus { cc1, cc2 }
    }

    /// Wait until the CC status satisfies a predicate (without debounce).
    async fn wait_for_cc(&self, predicate: impl Fn(CcStatus) -> bool) -> CcStatus {
        let mut status = self.phy.cc_status();
        while !predicate(status) {
            status = self.phy.wait_for_cc_change(status).await;
        }
        status
    }

    /// Wait until a debounced source termination plus VBUS is seen, as a
    /// sink in a Try/TryWait state.
    async fn wait_for_sink_attach(&self, timer_type: TimerType) -> (CcPin, RpLevel) {
        loop {
            let status = self.debounced_cc_status(timer_type).await;
            if let Some((line, level)) = Self::single_rp_line(status) {
                if self.phy.vbus_present() {
                    return (line, level);
                }
            }
        }
    }

    fn initial_unattached_state(&self) -> State {
        match self.config.port_role {
            PortRole::Sink => State::UnattachedSnk,
            PortRole::Source => State::UnattachedSrc,
            // Dual-role ports start toggling from the sink side.
            PortRole::Dual => State::UnattachedSnk,
        }
    }

    /// The line that presents a source termination, if exactly one does.
    fn single_rp_line(status: CcStatus) -> Option<(CcPin, RpLevel)> {
        match (status.cc1, status.cc2) {
            (CcTermination::Rp(level), cc2) if !matches!(cc2, CcTermination::Rp(_)) => Some((CcPin::Cc1, level)),
            (cc1, CcTermination::Rp(level)) if !matches!(cc1, CcTermination::Rp(_)) => Some((CcPin::Cc2, level)),
            _ => None,
        }
    }

    /// The line that presents a sink termination, if exactly one does.
    fn single_rd_line(status: CcStatus) -> Option<CcPin> {
        match (status.cc1, status.cc2) {
            (CcTermination::Rd, cc2) if cc2 != CcTermination::Rd => Some(CcPin::Cc1),
            (cc1, CcTermination::Rd) if cc1 != CcTermination::Rd => Some(CcPin::Cc2),
            _ => None,
        }
    }

    fn sink_attachment(line: CcPin, level: RpLevel) -> Attachment {
        Attachment {
            power_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            orientation: line,
            sink_current: Some(level),
            vconn_line: None,
        }
    }

    fn source_attachment(status: CcStatus, line: CcPin) -> Attachment {
        let other = line.other();
        Attachment {
            power_role: PowerRole::Source,
            data_role: DataRole::Dfp,
            orientation: line,
            sink_current: None,
            vconn_line: (status.line(other) == CcTermination::Ra).then_some(other),
        }
    }

    /// Run the connection state machine until a partner or accessory is attached.
    ///
    /// Applies supply side effects (VBUS/VCONN on for sources) before
    /// returning the resolved attachment.
    pub async fn run_until_attached(&mut self) -> Result<Attached, Error> {
        loop {
            if let Some(attached) = self.update_state().await? {
                return Ok(attached);
            }
        }
    }

    /// Run a single state transition.
    ///
    /// Returns the attachment once an attached or accessory state is reached.
    async fn update_state(&mut self) -> Result<Option<Attached>, Error> {
        let new_state = match self.state {
            State::Disabled => {
                if self.config.dead_battery {
                    // Dead-battery Rd is presented by hardware; mirror it.
                    self.phy.set_cc_pull(CcPull::Rd);
                }
                self.initial_unattached_state()
            }

            State::ErrorRecovery => {
                self.phy.set_cc_pull(CcPull::Open);
                self.rails.set_vbus(false).await;
                self.rails.set_vconn(CcPin::Cc1, false).await;
                self.rails.set_vconn(CcPin::Cc2, false).await;
                self.rails.discharge_vbus().await;

                TimerType::get_timer::<TIMER>(TimerType::ErrorRecovery).await;
                self.initial_unattached_state()
            }

            State::UnattachedSnk => {
                self.phy.set_cc_pull(CcPull::Rd);

                let attach_fut = self.wait_for_cc(|status| {
                    matches!(status.cc1, CcTermination::Rp(_)) || matches!(status.cc2, CcTermination::Rp(_))
                });

                if self.config.port_role == PortRole::Dual {
                    let toggle_fut = TimerType::get_timer::<TIMER>(TimerType::DrpToggle);
                    match select(attach_fut, toggle_fut).await {
                        Either::First(_) => State::AttachWaitSnk,
                        Either::Second(_) => State::UnattachedSrc,
                    }
                } else {
                    attach_fut.await;
                    State::AttachWaitSnk
                }
            }

            State::AttachWaitSnk => {
                let status = self.debounced_cc_status(TimerType::CCDebounce).await;

                match (Self::single_rp_line(status), status.cc1, status.cc2) {
                    (_, CcTermination::Rp(_), CcTermination::Rp(_)) if self.config.debug_accessory => {
                        State::DebugAccessory
                    }
                    (Some((line, level)), _, _) => {
                        // Sink attach additionally requires VBUS.
                        if !self.phy.vbus_present() {
                            let cc_lost = {
                                let vbus_fut = self.phy.wait_for_vbus_change(false);
                                let cc_fut = self.wait_for_cc(|s| Self::single_rp_line(s).is_none());
                                matches!(select(vbus_fut, cc_fut).await, Either::Second(_))
                            };

                            if cc_lost {
                                self.state = self.initial_unattached_state();
                                return Ok(None);
                            }
                        }

                        match self.config.try_role {
                            TryRole::TrySrc => State::TrySrc,
                            _ => {
                                self.state = State::AttachedSnk;
                                return Ok(Some(Attached::Sink(Self::sink_attachment(line, level))));
                            }
                        }
                    }
                    _ => self.initial_unattached_state(),
                }
            }

            State::UnattachedSrc => {
                self.phy.set_cc_pull(CcPull::Rp(self.rp_level));

                let attach_fut = self.wait_for_cc(|status| {
                    status.cc1 == CcTermination::Rd
                        || status.cc2 == CcTermination::Rd
                        || (status.cc1 == CcTermination::Ra && status.cc2 == CcTermination::Ra)
                });

                if self.config.port_role == PortRole::Dual {
                    let toggle_fut = TimerType::get_timer::<TIMER>(TimerType::DrpToggle);
                    match select(attach_fut, toggle_fut).await {
                        Either::First(_) => State::AttachWaitSrc,
                        Either::Second(_) => State::UnattachedSnk,
                    }
                } else {
                    attach_fut.await;
                    State::AttachWaitSrc
                }
            }

            State::AttachWaitSrc => {
                let status = self.debounced_cc_status(TimerType::CCDebounce).await;

                match (status.cc1, status.cc2) {
                    (CcTermination::Ra, CcTermination::Ra) if self.config.audio_accessory => State::AudioAccessory,
                    (CcTermination::Rd, CcTermination::Rd) if self.config.debug_accessory => State::DebugAccessory,
                    _ => match Self::single_rd_line(status) {
                        Some(line) => match self.config.try_role {
                            TryRole::TrySnk => State::TrySnk,
                            _ => {
                                return Ok(Some(self.enter_attached_src(status, line).await));
                            }
                        },
                        None => self.initial_unattached_state(),
                    },
                }
            }

            State::TrySrc => {
                self.phy.set_cc_pull(CcPull::Rp(self.rp_level));

                let selected = {
                    let debounce_fut = async {
                        loop {
                            let status = self.debounced_cc_status(TimerType::PdDebounce).await;
                            if let Some(line) = Self::single_rd_line(status) {
                                return (status, line);
                            }
                        }
                    };
                    let timeout_fut = TimerType::get_timer::<TIMER>(TimerType::TryDrp);
                    select(debounce_fut, timeout_fut).await
                };

                match selected {
                    Either::First((status, line)) => {
                        return Ok(Some(self.enter_attached_src(status, line).await));
                    }
                    Either::Second(_) => State::TryWaitSnk,
                }
            }

            State::TryWaitSnk => {
                self.phy.set_cc_pull(CcPull::Rd);

                let selected = {
                    let debounce_fut = self.wait_for_sink_attach(TimerType::PdDebounce);
                    let timeout_fut = TimerType::get_timer::<TIMER>(TimerType::TryTimeout);
                    select(debounce_fut, timeout_fut).await
                };

                match selected {
                    Either::First((line, level)) => {
                        self.state = State::AttachedSnk;
                        return Ok(Some(Attached::Sink(Self::sink_attachment(line, level))));
                    }
                    Either::Second(_) => self.initial_unattached_state(),
                }
            }

            State::TrySnk => {
                self.phy.set_cc_pull(CcPull::Rd);

                let selected = {
                    let debounce_fut = self.wait_for_sink_attach(TimerType::PdDebounce);
                    let timeout_fut = TimerType::get_timer::<TIMER>(TimerType::TryDrp);
                    select(debounce_fut, timeout_fut).await
                };

                match selected {
                    Either::First((line, level)) => {
                        self.state = State::AttachedSnk;
                        return Ok(Some(Attached::Sink(Self::sink_attachment(line, level))));
                    }
                    Either::Second(_) => State::TryWaitSrc,
                }
            }

            State::TryWaitSrc => {
                self.phy.set_cc_pull(CcPull::Rp(self.rp_level));

                let selected = {
                    let debounce_fut = async {
                        loop {
                            let status = self.debounced_cc_status(TimerType::PdDebounce).await;
                            if let Some(line) = Self::single_rd_line(status) {
                                return (status, line);
                            }
                        }
                    };
                    let timeout_fut = TimerType::get_timer::<TIMER>(TimerType::TryTimeout);
                    select(debounce_fut, timeout_fut).await
                };

                match selected {
                    Either::First((status, line)) => {
                        return Ok(Some(self.enter_attached_src(status, line).await));
                    }
                    Either::Second(_) => self.initial_unattached_state(),
                }
            }

            State::UnattachedWaitSrc => {
                self.rails.set_vbus(false).await;
                self.rails.set_vconn(CcPin::Cc1, false).await;
                self.rails.set_vconn(CcPin::Cc2, false).await;
                self.rails.discharge_vbus().await;

                TimerType::get_timer::<TIMER>(TimerType::VCONNDischarge).await;
                State::UnattachedSrc
            }

            State::AttachedSnk | State::AttachedSrc | State::AudioAccessory | State::DebugAccessory => {
                // Already attached; resolved below.
                self.state
            }
        };

        self.state = new_state;

        Ok(match self.state {
            State::AudioAccessory => Some(Attached::AudioAccessory),
            State::DebugAccessory => Some(Attached::DebugAccessory),
            _ => None,
        })
    }

    /// Enter Attached.SRC: apply supplies and report the attachment.
    async fn enter_attached_src(&mut self, status: CcStatus, line: CcPin) -> Attached {
        let attachment = Self::source_attachment(status, line);

        self.rails.set_vbus(true).await;
        if let Some(vconn_line) = attachment.vconn_line {
            self.rails.set_vconn(vconn_line, true).await;
        }

        self.state = State::AttachedSrc;
        Attached::Source(attachment)
    }

    /// Monitor the attached connection for detach.
    ///
    /// As source, detach is the partner's Rd disappearing (debounced with
    /// the short source detach period). As sink, detach is the partner's Rp
    /// disappearing for the Rd debounce period; VBUS loss alone is not a
    /// detach, since it also occurs during hard reset.
    pub async fn wait_for_detach(&self, attachment: &Attachment) {
        let line = attachment.orientation;
        let (attached, debounce): (fn(CcTermination) -> bool, _) = match attachment.power_role {
            PowerRole::Source => (|term| term == CcTermination::Rd, TimerType::SourceDetachDebounce),
            PowerRole::Sink => (|term| matches!(term, CcTermination::Rp(_)), TimerType::RdDebounce),
        };

        loop {
            // Wait for the monitored line to leave its attached condition,
            // then require the loss to persist for the debounce period.
            self.wait_for_cc(|status| !attached(status.line(line))).await;

            let status = self.debounced_cc_status(debounce).await;
            if !attached(status.line(line)) {
                return;
            }
        }
    }

    /// Wait for an accessory to detach (both lines returning to open).
    pub async fn wait_for_accessory_detach(&self) {
        loop {
            self.wait_for_cc(|status| {
                status.cc1 == CcTermination::Open || status.cc2 == CcTermination::Open
            })
            .await;

            let status = self.debounced_cc_status(TimerType::CCDebounce).await;
            if status == CcStatus::OPEN {
                return;
            }
        }
    }

    /// Wait for a physical fault report from the PHY.
    pub async fn wait_for_fault(&self) -> pdport_traits::Fault {
        self.phy.wait_for_fault().await
    }

    /// Access the power rails, e.g. for policy-driven VBUS cycling.
    pub fn rails(&mut self) -> &mut RAILS {
        &mut self.rails
    }

    /// Access the PHY.
    pub fn phy(&mut self) -> &mut PHY {
        &mut self.phy
    }
}
