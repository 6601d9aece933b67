//! Cable discovery towards the SOP' cable plug.
//!
//! A source with VCONN available interrogates the cable marker with
//! Discover Identity before advertising capabilities, to learn the cable's
//! current and voltage limits. Discovery is retried a bounded number of
//! times; without a response the port assumes a passive, non-marked cable.
use heapless::Vec;
use pdport_traits::{Driver, SopTarget};

use crate::counters::{Counter, CounterType};
use crate::protocol_layer::message::data::vendor_defined::{
    CableCurrent, CableMaxVoltage, CableVdo, VdmCommand, VdmCommandType, VdmHeader, VdmHeaderStructured,
};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::header::{DataMessageType, MessageType};
use crate::protocol_layer::message::Payload;
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError};
use crate::timers::{Timer, TimerType};

/// States of the cable discovery sub-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Discovery is inactive.
    Disabled,
    /// Discovery is starting up, waiting for VCONN to settle.
    Entry,
    /// Soft-resetting the cable marker's protocol state.
    SendSoftReset,
    /// Sending Discover Identity and awaiting the response.
    SendDiscoverId,
}

/// Identity of an electronically marked cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CableIdentity {
    /// Maximum VBUS voltage the cable supports.
    pub max_voltage: CableMaxVoltage,
    /// Maximum VBUS current the cable supports.
    pub max_current: CableCurrent,
    /// Whether the cable reports EPR capability.
    pub epr_capable: bool,
    /// Whether this is an active cable.
    pub active: bool,
}

impl CableIdentity {
    fn from_vdos(objects: &Vec<u32, 7>) -> Option<Self> {
        // Discover Identity ACK: ID header, cert stat, product, cable VDO(s).
        if objects.len() < 4 {
            return None;
        }

        let id_header = crate::protocol_layer::message::data::vendor_defined::VdmIdentityHeader(objects[0]);
        let cable_vdo = CableVdo(objects[3]);

        if !id_header.is_passive_cable() && !id_header.is_active_cable() {
            return None;
        }

        Some(CableIdentity {
            max_voltage: cable_vdo.max_voltage(),
            max_current: cable_vdo.max_current(),
            epr_capable: cable_vdo.epr_mode_capable(),
            active: id_header.is_active_cable(),
        })
    }
}

/// The cable discovery sub-machine.
#[derive(Debug)]
pub struct CableDiscovery {
    state: State,
    discover_identity: Counter,
}

impl Default for CableDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl CableDiscovery {
    /// Create a new, inactive discovery sub-machine.
    pub fn new() -> Self {
        Self {
            state: State::Disabled,
            discover_identity: Counter::new(CounterType::DiscoverIdentity),
        }
    }

    /// The current discovery state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Run cable discovery to completion.
    ///
    /// Returns the identity of an electronically marked cable, or `None`
    /// after the Discover Identity retry budget is exhausted.
    pub async fn run<DRIVER: Driver, TIMER: Timer>(
        &mut self,
        protocol_layer: &mut ProtocolLayer<DRIVER, TIMER>,
    ) -> Result<Option<CableIdentity>, ProtocolError> {
        self.state = State::Entry;
        self.discover_identity.reset();

        loop {
            match self.state {
                State::Disabled => return Ok(None),
                State::Entry => {
                    // Let VCONN settle before the marker can answer.
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOn).await;
                    self.state = State::SendSoftReset;
                }
                State::SendSoftReset => match protocol_layer.soft_reset_endpoint(SopTarget::SopPrime).await {
                    Ok(()) => self.state = State::SendDiscoverId,
                    Err(
                        ProtocolError::TransmitRetriesExceeded(_)
                        | ProtocolError::RxError(RxError::ReceiveTimeout)
                        | ProtocolError::UnexpectedMessage,
                    ) => {
                        if self.discover_identity.increment().is_err() {
                            debug!("No cable marker detected");
                            self.state = State::Disabled;
                        }
                    }
                    Err(other) => return Err(other),
                },
                State::SendDiscoverId => {
                    match self.discover_identity_once(protocol_layer).await {
                        Ok(Some(identity)) => {
                            debug!("Cable identified: {:?}", identity);
                            self.state = State::Disabled;
                            return Ok(Some(identity));
                        }
                        Ok(None)
                        | Err(
                            ProtocolError::TransmitRetriesExceeded(_)
                            | ProtocolError::RxError(RxError::ReceiveTimeout)
                            | ProtocolError::UnexpectedMessage,
                        ) => {
                            if self.discover_identity.increment().is_err() {
                                debug!("Cable discovery retries exhausted");
                                self.state = State::Disabled;
                            }
                        }
                        Err(other) => return Err(other),
                    };
                }
            }
        }
    }

    /// One Discover Identity attempt towards SOP'.
    async fn discover_identity_once<DRIVER: Driver, TIMER: Timer>(
        &mut self,
        protocol_layer: &mut ProtocolLayer<DRIVER, TIMER>,
    ) -> Result<Option<CableIdentity>, ProtocolError> {
        protocol_layer
            .transmit_vdm(
                SopTarget::SopPrime,
                VdmHeader::Structured(VdmHeaderStructured::discover_identity_request()),
                Vec::new(),
            )
            .await?;

        let message = protocol_layer
            .receive_message_type(
                SopTarget::SopPrime,
                &[MessageType::Data(DataMessageType::VendorDefined)],
                TimerType::VDMResponse,
            )
            .await?;

        let Some(Payload::Data(Data::VendorDefined((header, objects)))) = message.payload else {
            return Ok(None);
        };

        let VdmHeader::Structured(header) = header else {
            return Ok(None);
        };

        if header.command() != VdmCommand::DiscoverIdentity || header.command_type() != VdmCommandType::ResponderAck {
            return Ok(None);
        }

        Ok(CableIdentity::from_vdos(&objects))
    }
}
