//! Tests for the Type-C connection manager.
use pdport_traits::{CcPin, CcPull, CcStatus, CcTermination, RpLevel};

use super::{Attached, ConnectionManager, State};
use crate::config::PortConfig;
use crate::dummy::{DummyPhy, DummyRails, NeverTimer, RailOperation, RangeTimer};
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject};
use crate::timers::Timer;
use crate::{DataRole, PowerRole};

/// Fires every timer immediately, so debounce periods elapse at once.
type ElapsedTimer = RangeTimer<0, 20000>;

fn rp_on_cc1(level: RpLevel) -> CcStatus {
    CcStatus {
        cc1: CcTermination::Rp(level),
        cc2: CcTermination::Open,
    }
}

fn get_manager<TIMER: Timer>(
    config: PortConfig,
) -> (DummyPhy, DummyRails, ConnectionManager<DummyPhy, DummyRails, TIMER>) {
    let phy = DummyPhy::new();
    let rails = DummyRails::new();
    let manager = ConnectionManager::new(phy.clone(), rails.clone(), config);
    (phy, rails, manager)
}

fn source_config() -> PortConfig {
    let mut pdos: heapless::Vec<PowerDataObject, 7> = heapless::Vec::new();
    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
    ))
    .unwrap();
    PortConfig::source_default(pdos)
}

#[tokio::test]
async fn test_sink_attach_after_debounce() {
    let (phy, _rails, mut manager) = get_manager::<ElapsedTimer>(PortConfig::sink_default());

    phy.set_cc_status(rp_on_cc1(RpLevel::Level3A0));
    phy.set_vbus(true);

    let attached = manager.run_until_attached().await.unwrap();

    let Attached::Sink(attachment) = attached else {
        panic!("Expected a sink attachment");
    };
    assert_eq!(attachment.power_role, PowerRole::Sink);
    assert_eq!(attachment.data_role, DataRole::Ufp);
    assert_eq!(attachment.orientation, CcPin::Cc1);
    assert_eq!(attachment.sink_current, Some(RpLevel::Level3A0));
    assert_eq!(manager.state(), State::AttachedSnk);
    assert_eq!(phy.applied_pull(), Some(CcPull::Rd));
}

#[tokio::test]
async fn test_attach_never_happens_before_debounce() {
    // Debounce timers that never fire: the manager must stay in AttachWait
    // no matter how stable the line is.
    let (phy, _rails, mut manager) = get_manager::<NeverTimer>(PortConfig::sink_default());

    phy.set_cc_status(rp_on_cc1(RpLevel::Level1A5));
    phy.set_vbus(true);

    let attach_fut = manager.run_until_attached();
    let probe = embassy_futures::select::select(attach_fut, core::future::ready(())).await;
    assert!(matches!(probe, embassy_futures::select::Either::Second(())));

    assert_eq!(manager.state(), State::AttachWaitSnk);
}

#[tokio::test]
async fn test_source_attach_applies_vbus_and_vconn() {
    let (phy, rails, mut manager) = get_manager::<ElapsedTimer>(source_config());

    phy.set_cc_status(CcStatus {
        cc1: CcTermination::Rd,
        cc2: CcTermination::Ra,
    });

    let attached = manager.run_until_attached().await.unwrap();

    let Attached::Source(attachment) = attached else {
        panic!("Expected a source attachment");
    };
    assert_eq!(attachment.power_role, PowerRole::Source);
    assert_eq!(attachment.data_role, DataRole::Dfp);
    assert_eq!(attachment.orientation, CcPin::Cc1);
    assert_eq!(attachment.vconn_line, Some(CcPin::Cc2));
    assert_eq!(manager.state(), State::AttachedSrc);

    let operations = rails.operations();
    assert!(operations.contains(&RailOperation::Vbus(true)));
    assert!(operations.contains(&RailOperation::Vconn(CcPin::Cc2, true)));
}

#[tokio::test]
async fn test_audio_accessory_detected() {
    let mut config = source_config();
    config.audio_accessory = true;
    let (phy, _rails, mut manager) = get_manager::<ElapsedTimer>(config);

    phy.set_cc_status(CcStatus {
        cc1: CcTermination::Ra,
        cc2: CcTermination::Ra,
    });

    let attached = manager.run_until_attached().await.unwrap();
    assert_eq!(attached, Attached::AudioAccessory);
    assert_eq!(manager.state(), State::AudioAccessory);
}

#[tokio::test]
async fn test_error_recovery_removes_supplies_before_reattach() {
    let (phy, rails, mut manager) = get_manager::<ElapsedTimer>(PortConfig::sink_default());

    phy.set_cc_status(rp_on_cc1(RpLevel::Default));
    phy.set_vbus(true);
    manager.trigger_error_recovery();

    let attached = manager.run_until_attached().await.unwrap();
    assert!(matches!(attached, Attached::Sink(_)));

    // Error recovery removed all supplies before the port re-attached.
    let operations = rails.operations();
    assert_eq!(
        &operations[..4],
        &[
            RailOperation::Vbus(false),
            RailOperation::Vconn(CcPin::Cc1, false),
            RailOperation::Vconn(CcPin::Cc2, false),
            RailOperation::Discharge,
        ]
    );
    assert_eq!(phy.applied_pull(), Some(CcPull::Rd));
}
