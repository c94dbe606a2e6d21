//! Integration tests for the TDK-Lambda ZUP driver over the port arbiter

mod common;

use common::{zup_reply, SimWire};
use labd::hardware::tdk_lambda::{ZupArgs, ZupPowerSupply};
use labd::hardware::{ConnectionTestable, Openable, PowerSupplyMode, VoltageCurrentControllable};
use labd::serial::PortRegistry;
use std::sync::{Arc, Mutex};

fn zup(address: u8, ports: &PortRegistry) -> ZupPowerSupply {
    let args = ZupArgs {
        port: "sim-zup".into(),
        baudrate: 9600,
        address,
        settle_ms: 0,
        timeout_ms: 100,
    };
    ZupPowerSupply::new(&args, ports.clone()).unwrap()
}

/// Two ZUPs on one bus; each reports its own address as its voltage.
fn bus_of_units() -> SimWire {
    let addressed = Arc::new(Mutex::new(0u8));
    SimWire::new(move |cmd| {
        if let Some(unit) = cmd.strip_prefix(":ADR").and_then(|rest| rest.strip_suffix(';')) {
            *addressed.lock().unwrap() = unit.parse().unwrap();
            return None;
        }
        match cmd {
            ":VOL?;" => Some(format!("AV{}.000", *addressed.lock().unwrap())),
            other => zup_reply(other),
        }
    })
}

#[tokio::test]
async fn test_zup_session_reads_and_programs() {
    let wire = SimWire::zup();
    let ports = wire.registry();
    let supply = zup(1, &ports);

    supply.open().await.unwrap();
    supply.test_connection().await.unwrap();

    assert_eq!(supply.get_mode().await.unwrap(), PowerSupplyMode::ConstantVoltage);
    assert!(supply.is_output_on().await.unwrap());
    assert_eq!(supply.get_target_voltage().await.unwrap(), 8.0);
    assert_eq!(supply.get_actual_voltage().await.unwrap(), 7.998);
    assert_eq!(supply.get_target_current().await.unwrap(), 3.0);
    assert_eq!(supply.get_actual_current().await.unwrap(), 1.6);
    assert_eq!(supply.software_version().await.unwrap(), "Ver 36-6 1.1");

    supply.set_target_voltage(4.25).await.unwrap();
    supply.set_target_current(1.5).await.unwrap();
    supply.set_output_on(false).await.unwrap();
    supply.close().await.unwrap();

    let log = wire.log();
    assert_eq!(log.first().map(String::as_str), Some(":ADR01;"));
    assert_eq!(log[log.len() - 3..], [":VOL4.250;", ":CUR001.50;", ":OUT0;"]);
    assert!(ports.is_empty());
}

#[tokio::test]
async fn test_two_supplies_share_one_bus() {
    let wire = SimWire::zup();
    let ports = wire.registry();
    let first = zup(1, &ports);
    let second = zup(2, &ports);

    first.open().await.unwrap();
    second.open().await.unwrap();
    assert_eq!(ports.client_count("sim-zup"), Some(2));
    assert_eq!(wire.opens(), 1);

    assert_eq!(first.get_target_voltage().await.unwrap(), 8.0);
    assert!(second.is_output_on().await.unwrap());
    assert!(second.is_output_on().await.unwrap());
    assert_eq!(
        wire.log(),
        [":ADR01;", ":ADR02;", ":ADR01;", ":VOL!;", ":ADR02;", ":OUT?;", ":OUT?;"]
    );

    first.close().await.unwrap();
    assert_eq!(ports.client_count("sim-zup"), Some(1));
    assert!(second.is_output_on().await.unwrap());

    second.close().await.unwrap();
    assert!(ports.is_empty());
    assert_eq!(wire.closes(), 1);
}

#[tokio::test]
async fn test_interleaved_reads_come_from_the_right_unit() {
    let wire = bus_of_units();
    let ports = wire.registry();
    let first = zup(1, &ports);
    let second = zup(2, &ports);

    first.open().await.unwrap();
    second.open().await.unwrap();

    for _ in 0..3 {
        assert_eq!(first.get_actual_voltage().await.unwrap(), 1.0);
        assert_eq!(second.get_actual_voltage().await.unwrap(), 2.0);
    }

    let (a, b) = tokio::join!(first.get_actual_voltage(), second.get_actual_voltage());
    assert_eq!((a.unwrap(), b.unwrap()), (1.0, 2.0));

    first.close().await.unwrap();
    second.close().await.unwrap();
    assert!(ports.is_empty());
}

#[tokio::test]
async fn test_nested_open_keeps_the_port_until_the_last_close() {
    let wire = SimWire::zup();
    let ports = wire.registry();
    let supply = zup(1, &ports);

    // an experiment holds it open while a status request opens and closes
    supply.open().await.unwrap();
    supply.open().await.unwrap();
    assert_eq!(supply.open_count().await, 2);
    supply.close().await.unwrap();

    assert_eq!(supply.open_count().await, 1);
    assert_eq!(ports.client_count("sim-zup"), Some(1));
    assert_eq!(supply.get_actual_voltage().await.unwrap(), 7.998);

    supply.close().await.unwrap();
    assert!(ports.is_empty());
    supply.close().await.unwrap();
    assert_eq!(supply.open_count().await, 0);
    assert_eq!(wire.opens(), 1);
}

#[tokio::test]
async fn test_extra_close_is_harmless_and_closed_supply_refuses_commands() {
    let wire = SimWire::zup();
    let ports = wire.registry();
    let supply = zup(1, &ports);

    supply.open().await.unwrap();
    supply.open().await.unwrap();
    assert_eq!(ports.client_count("sim-zup"), Some(1));

    supply.close().await.unwrap();
    supply.close().await.unwrap();
    assert!(ports.is_empty());
    supply.close().await.unwrap();

    let err = supply.get_mode().await.unwrap_err();
    assert_eq!(err.kind(), "ConnectivityError");
}

#[tokio::test]
async fn test_close_before_open_is_a_no_op() {
    let wire = SimWire::zup();
    let ports = wire.registry();
    let supply = zup(1, &ports);

    supply.close().await.unwrap();
    assert!(ports.is_empty());
    assert_eq!(wire.opens(), 0);
}

#[tokio::test]
async fn test_silent_device_fails_connection_test() {
    let wire = SimWire::new(|_| None);
    let ports = wire.registry();
    let supply = zup(1, &ports);

    supply.open().await.unwrap();
    let err = supply.test_connection().await.unwrap_err();
    assert_eq!(err.kind(), "ConnectivityError");
    supply.close().await.unwrap();
}

#[tokio::test]
async fn test_garbled_reading_is_a_protocol_error() {
    let wire = SimWire::new(|cmd| match cmd {
        ":VOL?;" => Some("AV??".to_string()),
        other => zup_reply(other),
    });
    let ports = wire.registry();
    let supply = zup(1, &ports);

    supply.open().await.unwrap();
    let err = supply.get_actual_voltage().await.unwrap_err();
    assert_eq!(err.kind(), "ProtocolParseError");
    assert_eq!(supply.get_actual_current().await.unwrap(), 1.6);
    supply.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_port_fails_open() {
    let wire = SimWire::zup();
    wire.set_fail_open(true);
    let ports = wire.registry();
    let supply = zup(1, &ports);

    let err = supply.open().await.unwrap_err();
    assert_eq!(err.kind(), "ConnectivityError");
    assert!(ports.is_empty());
}
