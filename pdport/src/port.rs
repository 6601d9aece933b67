//! The port context: root aggregate of one physical port.
//!
//! Owns the configuration, the Type-C connection manager and the lifecycle
//! of the protocol layer and policy engines. The port task runs the
//! connection manager until attach, spins up the policy engine for the
//! resolved role, and races it against detach and fault monitoring. On
//! detach, all protocol state is torn down.
use core::marker::PhantomData;

use embassy_futures::select::{Either3, select, select3};
use pdport_traits::{Driver, PowerControl, TypeCPhy};

use crate::config::PortConfig;
use crate::dpm::{self, Command, DevicePolicy};
use crate::sink::{self, Sink};
use crate::source::{self, Source};
use crate::timers::Timer;
use crate::type_c::{Attached, Attachment, ConnectionManager};
use crate::PowerRole;

/// Errors that end the port task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port was disabled.
    PortDisabled,
}

/// What ended a policy engine run.
enum EngineOutcome {
    Detached,
    Fault(pdport_traits::Fault),
    BecameSink,
    BecameSource,
    TypeCCommand(Command),
    NoPdPartner,
    PartnerUnresponsive,
}

/// One physical port: configuration, connection manager, policy engines.
pub struct Port<PHY, RAILS, DRIVER, TIMER, DPM>
where
    PHY: TypeCPhy,
    RAILS: PowerControl,
    DRIVER: Driver,
    TIMER: Timer,
    DPM: sink::device_policy_manager::DevicePolicyManager + source::device_policy_manager::DevicePolicyManager,
{
    connection: ConnectionManager<PHY, RAILS, TIMER>,
    driver: Option<DRIVER>,
    device_policy_manager: Option<DPM>,
    config: PortConfig,
    _timer: PhantomData<TIMER>,
}

impl<PHY, RAILS, DRIVER, TIMER, DPM> Port<PHY, RAILS, DRIVER, TIMER, DPM>
where
    PHY: TypeCPhy,
    RAILS: PowerControl,
    DRIVER: Driver,
    TIMER: Timer,
    DPM: sink::device_policy_manager::DevicePolicyManager + source::device_policy_manager::DevicePolicyManager,
{
    /// Create a new port from its hardware and policy collaborators.
    pub fn new(phy: PHY, rails: RAILS, driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        Self {
            connection: ConnectionManager::new(phy, rails, config.clone()),
            driver: Some(driver),
            device_policy_manager: Some(device_policy_manager),
            config,
            _timer: PhantomData,
        }
    }

    /// The Type-C connection manager of this port.
    pub fn connection(&mut self) -> &mut ConnectionManager<PHY, RAILS, TIMER> {
        &mut self.connection
    }

    /// Run the port task.
    ///
    /// Returns only when the port is disabled.
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            let attached = self
                .connection
                .run_until_attached()
                .await
                .map_err(|_| Error::PortDisabled)?;

            match attached {
                Attached::Sink(attachment) => self.run_partner(attachment).await?,
                Attached::Source(attachment) => self.run_partner(attachment).await?,
                Attached::AudioAccessory | Attached::DebugAccessory => {
                    let event = if attached == Attached::AudioAccessory {
                        dpm::Event::AudioAccessoryAttached
                    } else {
                        dpm::Event::DebugAccessoryAttached
                    };
                    self.notify(&event).await;

                    self.connection.wait_for_accessory_detach().await;
                    self.notify(&dpm::Event::Detached).await;
                }
            }

            self.connection.detached().await;
        }
    }

    async fn notify(&mut self, event: &dpm::Event) {
        if let Some(dpm) = self.device_policy_manager.as_mut() {
            DevicePolicy::notify(dpm, event).await;
        }
    }

    /// Run policy engines against an attached partner until detach, fault,
    /// or an unrecoverable engine error.
    async fn run_partner(&mut self, attachment: Attachment) -> Result<(), Error> {
        let mut power_role = attachment.power_role;
        let mut after_swap = false;

        self.notify(&dpm::Event::Attached(power_role)).await;

        loop {
            let mut driver = self.driver.take().unwrap();
            let mut dpm = self.device_policy_manager.take().unwrap();
            let entered_by_swap = core::mem::take(&mut after_swap);

            let outcome = match power_role {
                PowerRole::Sink => {
                    let mut engine = Sink::new(driver, dpm, self.config.clone());
                    let outcome = self.race_engine_sink(&mut engine, &attachment).await;
                    (driver, dpm) = engine.into_parts();
                    outcome
                }
                PowerRole::Source => {
                    let mut engine = if entered_by_swap {
                        Source::new_after_power_role_swap(driver, dpm, self.config.clone())
                    } else {
                        Source::new(driver, dpm, self.config.clone())
                    };
                    let outcome = self.race_engine_source(&mut engine, &attachment).await;
                    (driver, dpm) = engine.into_parts();
                    outcome
                }
            };

            self.driver = Some(driver);
            self.device_policy_manager = Some(dpm);

            match outcome {
                EngineOutcome::Detached => {
                    self.notify(&dpm::Event::Detached).await;
                    return Ok(());
                }
                EngineOutcome::Fault(fault) => {
                    self.notify(&dpm::Event::Fault(fault)).await;
                    self.notify(&dpm::Event::TypeCErrorRecovery).await;
                    self.connection.trigger_error_recovery();
                    return Ok(());
                }
                EngineOutcome::BecameSink => {
                    power_role = PowerRole::Sink;
                    after_swap = true;
                }
                EngineOutcome::BecameSource => {
                    power_role = PowerRole::Source;
                    after_swap = true;
                }
                EngineOutcome::TypeCCommand(command) => match command {
                    Command::PortDisable => {
                        self.connection.disable().await;
                        return Err(Error::PortDisabled);
                    }
                    Command::ErrorRecovery => {
                        self.notify(&dpm::Event::TypeCErrorRecovery).await;
                        self.connection.trigger_error_recovery();
                        return Ok(());
                    }
                    Command::SetRp(level) => {
                        self.connection.set_rp(level);
                        // Re-enter the engine; the partner re-negotiates
                        // under the new advertisement.
                    }
                    _ => unreachable!(),
                },
                EngineOutcome::NoPdPartner => {
                    // Stay attached without PD until detach or fault.
                    let detach_fut = self.connection.wait_for_detach(&attachment);
                    let fault_fut = self.connection.wait_for_fault();

                    match select(detach_fut, fault_fut).await {
                        embassy_futures::select::Either::First(()) => {
                            self.notify(&dpm::Event::Detached).await;
                            return Ok(());
                        }
                        embassy_futures::select::Either::Second(fault) => {
                            self.notify(&dpm::Event::Fault(fault)).await;
                            self.connection.trigger_error_recovery();
                            return Ok(());
                        }
                    }
                }
                EngineOutcome::PartnerUnresponsive => {
                    self.notify(&dpm::Event::TypeCErrorRecovery).await;
                    self.connection.trigger_error_recovery();
                    return Ok(());
                }
            }
        }
    }

    async fn race_engine_sink<D: Driver, M: sink::device_policy_manager::DevicePolicyManager>(
        &self,
        engine: &mut Sink<D, TIMER, M>,
        attachment: &Attachment,
    ) -> EngineOutcome {
        let run_fut = engine.run();
        let detach_fut = self.connection.wait_for_detach(attachment);
        let fault_fut = self.connection.wait_for_fault();

        match select3(run_fut, detach_fut, fault_fut).await {
            Either3::First(Ok(sink::policy_engine::Exit::PowerRoleSwap)) => EngineOutcome::BecameSource,
            Either3::First(Ok(sink::policy_engine::Exit::TypeCCommand(command))) => {
                EngineOutcome::TypeCCommand(command)
            }
            Either3::First(Err(_)) => EngineOutcome::PartnerUnresponsive,
            Either3::Second(()) => EngineOutcome::Detached,
            Either3::Third(fault) => EngineOutcome::Fault(fault),
        }
    }

    async fn race_engine_source<D: Driver, M: source::device_policy_manager::DevicePolicyManager>(
        &self,
        engine: &mut Source<D, TIMER, M>,
        attachment: &Attachment,
    ) -> EngineOutcome {
        let run_fut = engine.run();
        let detach_fut = self.connection.wait_for_detach(attachment);
        let fault_fut = self.connection.wait_for_fault();

        match select3(run_fut, detach_fut, fault_fut).await {
            Either3::First(Ok(source::policy_engine::Exit::PowerRoleSwap)) => EngineOutcome::BecameSink,
            Either3::First(Ok(source::policy_engine::Exit::PdIncapablePartner)) => EngineOutcome::NoPdPartner,
            Either3::First(Ok(source::policy_engine::Exit::TypeCCommand(command))) => {
                EngineOutcome::TypeCCommand(command)
            }
            Either3::First(Err(_)) => EngineOutcome::PartnerUnresponsive,
            Either3::Second(()) => EngineOutcome::Detached,
            Either3::Third(fault) => EngineOutcome::Fault(fault),
        }
    }
}
