//! Sub-states of the USB4 Data_Reset handshake.
//!
//! Both ends of a Data_Reset walk through this explicit sub-state sequence;
//! the DFP additionally cycles VCONN while data connections are torn down.
//! See [6.3.14].

/// The sub-state of an ongoing Data_Reset AMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataResetState {
    /// No Data_Reset in progress.
    #[default]
    Idle,
    /// Initiator waiting for the Accept response.
    WaitAccept,
    /// Accept sent, waiting for the next handshake step.
    Accepted,
    /// Waiting for PS_RDY at the end of the handshake.
    WaitPsRdy,
    /// Waiting for VCONN to be turned off.
    WaitVconnOff,
    /// Sending PS_RDY after VCONN turn-off.
    SendingPsRdy,
    /// DFP waiting to turn VCONN back on.
    WaitVconnOn,
    /// UFP waiting for Data_Reset_Complete.
    WaitCompletion,
    /// DFP delaying the Data_Reset_Complete message.
    CompleteDelay,
}
