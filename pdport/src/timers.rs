//! Timers that are used by the connection manager, protocol layer and policy engines.
use core::future::Future;

/// The timer trait to implement by the user application.
pub trait Timer {
    /// Expire after the specified number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;
}

/// Types of timers that are used for timeouts.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    BISTContMode,
    CCDebounce,
    ChunkSenderRequest,
    ChunkSenderResponse,
    CRCReceive,
    DataResetFail,
    DataResetFailUFP,
    DiscoverIdentity,
    DrpToggle,
    ErrorRecovery,
    HardResetComplete,
    NoResponse,
    PdDebounce,
    PSHardReset,
    PSSourceOffSpr,
    PSSourceOffEpr,
    PSSourceOnSpr,
    PSTransitionSpr,
    PSTransitionEpr,
    RdDebounce,
    SenderResponse,
    SinkEPREnter,
    SinkEPRKeepAlive,
    SinkPPSPeriodic,
    SinkRequest,
    SinkWaitCap,
    SourceCapability,
    SourceDetachDebounce,
    SourceEPRKeepAlive,
    SourceRecover,
    SourceTransition,
    SinkTx,
    SwapSourceStart,
    TryDrp,
    TryTimeout,
    VCONNDischarge,
    VCONNOn,
    VDMResponse,
}

impl TimerType {
    /// Create a new timer for a given type.
    ///
    /// Times out after a duration that is given by the USB PD and Type-C
    /// specification timing tables.
    pub fn get_timer<TIMER: Timer>(timer_type: TimerType) -> impl Future<Output = ()> {
        match timer_type {
            TimerType::BISTContMode => TIMER::after_millis(45),
            TimerType::CCDebounce => TIMER::after_millis(140),
            TimerType::ChunkSenderRequest => TIMER::after_millis(27),
            TimerType::ChunkSenderResponse => TIMER::after_millis(15),
            TimerType::CRCReceive => TIMER::after_millis(1),
            TimerType::DataResetFail => TIMER::after_millis(350),
            TimerType::DataResetFailUFP => TIMER::after_millis(500),
            TimerType::DiscoverIdentity => TIMER::after_millis(45),
            TimerType::DrpToggle => TIMER::after_millis(75),
            TimerType::ErrorRecovery => TIMER::after_millis(250),
            TimerType::HardResetComplete => TIMER::after_millis(5),
            TimerType::NoResponse => TIMER::after_millis(5000),
            TimerType::PdDebounce => TIMER::after_millis(11),
            TimerType::PSHardReset => TIMER::after_millis(30),
            TimerType::PSSourceOffSpr => TIMER::after_millis(835),
            TimerType::PSSourceOffEpr => TIMER::after_millis(1260),
            TimerType::PSSourceOnSpr => TIMER::after_millis(435),
            TimerType::PSTransitionSpr => TIMER::after_millis(500),
            TimerType::PSTransitionEpr => TIMER::after_millis(925),
            TimerType::RdDebounce => TIMER::after_millis(12),
            TimerType::SenderResponse => TIMER::after_millis(30),
            TimerType::SinkEPREnter => TIMER::after_millis(500),
            TimerType::SinkEPRKeepAlive => TIMER::after_millis(375),
            TimerType::SinkPPSPeriodic => TIMER::after_millis(5000),
            TimerType::SinkRequest => TIMER::after_millis(100),
            TimerType::SinkWaitCap => TIMER::after_millis(465),
            TimerType::SourceCapability => TIMER::after_millis(150),
            TimerType::SourceDetachDebounce => TIMER::after_millis(2),
            TimerType::SourceEPRKeepAlive => TIMER::after_millis(875),
            TimerType::SourceRecover => TIMER::after_millis(800),
            TimerType::SourceTransition => TIMER::after_millis(28),
            TimerType::SinkTx => TIMER::after_millis(18),
            TimerType::SwapSourceStart => TIMER::after_millis(20),
            TimerType::TryDrp => TIMER::after_millis(110),
            TimerType::TryTimeout => TIMER::after_millis(800),
            TimerType::VCONNDischarge => TIMER::after_millis(200),
            TimerType::VCONNOn => TIMER::after_millis(50),
            TimerType::VDMResponse => TIMER::after_millis(27),
        }
    }
}
