mod common;

use std::time::Duration;

use common::{test_config, SimulatedCrazyflie};
use crazyflie_crtp::subsystems::log::LogPeriod;
use crazyflie_crtp::{Crazyflie, Error, NoTocCache, Value, ValueType};

const LOG_PORT: u8 = 5;
const CONTROL_CHANNEL: u8 = 1;

async fn connect(sim: &SimulatedCrazyflie) -> Crazyflie {
    Crazyflie::connect_from_link(Box::new(sim.link(true)), NoTocCache, test_config())
        .await
        .unwrap()
}

#[tokio::test]
async fn log_is_reset_at_connection() {
    let sim = SimulatedCrazyflie::with_firmware(|fw| {
        fw.log_blocks.insert(3, Default::default());
    });
    let cf = connect(&sim).await;

    assert_eq!(sim.configure(|fw| fw.log_resets), 1);
    assert!(sim.log_block(3).is_none());

    assert_eq!(cf.log.names().len(), 5);
    assert_eq!(cf.log.get_type("pm.vbat").unwrap(), ValueType::F32);
    assert_eq!(cf.log.get_type("pm.state").unwrap(), ValueType::I8);
    assert_eq!(cf.log.get_type("motor.m1").unwrap(), ValueType::U16);
    assert!(matches!(cf.log.get_type("pm.nope"), Err(Error::LogError(_))));
}

#[tokio::test]
async fn block_streams_decoded_samples() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let mut block = cf.log.create_block().await.unwrap();
    block.add_variable("pm.vbat").await.unwrap();
    block.add_variable("pm.state").await.unwrap();
    let block_id = block.id();

    let stream = block.start(LogPeriod::from_millis(100).unwrap()).await.unwrap();

    let sim_block = sim.log_block(block_id).unwrap();
    // pm.vbat and pm.state are the TOC items 2 and 3
    assert_eq!(sim_block.variables, vec![2, 3]);
    assert_eq!(sim_block.period, Some(10));

    let mut values = 3.7f32.to_le_bytes().to_vec();
    values.push((-1i8) as u8);
    sim.send_log_data(block_id, 0x123456, &values);

    let sample = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample.timestamp, 0x123456);
    assert_eq!(sample.data["pm.vbat"], Value::F32(3.7));
    assert_eq!(sample.data["pm.state"], Value::I8(-1));

    let block = stream.stop().await.unwrap();
    assert_eq!(sim.log_block(block_id).unwrap().period, None);

    // A stopped block can be started again
    let _stream = block.start(LogPeriod::from_millis(1000).unwrap()).await.unwrap();
    assert_eq!(sim.log_block(block_id).unwrap().period, Some(100));
}

#[tokio::test]
async fn truncated_samples_are_errors() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let mut block = cf.log.create_block().await.unwrap();
    block.add_variable("stateEstimate.roll").await.unwrap();
    let block_id = block.id();
    let stream = block.start(LogPeriod::from_millis(10).unwrap()).await.unwrap();

    sim.send_log_data(block_id, 1, &[0, 0]);

    let sample = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap();
    assert!(matches!(sample, Err(Error::ProtocolError(_))));
}

#[tokio::test]
async fn unknown_variable_is_rejected() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let mut block = cf.log.create_block().await.unwrap();
    assert!(matches!(
        block.add_variable("not.there").await,
        Err(Error::VariableNotFound)
    ));
}

#[tokio::test]
async fn dropped_blocks_are_deleted_and_ids_reused() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let first = cf.log.create_block().await.unwrap();
    let second = cf.log.create_block().await.unwrap();
    assert_eq!(first.id(), 0);
    assert_eq!(second.id(), 1);

    drop(first);

    let third = cf.log.create_block().await.unwrap();
    assert_eq!(third.id(), 0);

    let deletes: Vec<_> = sim
        .received_on(LOG_PORT, CONTROL_CHANNEL)
        .into_iter()
        .filter(|p| p.get_data().first() == Some(&2))
        .map(|p| p.get_data().clone())
        .collect();
    assert_eq!(deletes, vec![vec![2, 0]]);
    assert!(sim.log_block(1).is_some());
}

#[tokio::test]
async fn firmware_errors_are_reported() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let block = cf.log.create_block().await.unwrap();
    // The firmware forgets the block, starting it fails with ENOENT
    sim.configure(|fw| fw.log_blocks.clear());

    assert!(matches!(
        block.start(LogPeriod::from_millis(100).unwrap()).await,
        Err(Error::LogError(_))
    ));
}

#[tokio::test]
async fn forgotten_block_id_is_reused() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let block = cf.log.create_block().await.unwrap();
    sim.configure(|fw| fw.log_blocks.clear());
    // A failed start drops the block
    assert!(block.start(LogPeriod::from_millis(100).unwrap()).await.is_err());

    // The firmware answers ENOENT to the delete, the id is free again
    let block = cf.log.create_block().await.unwrap();
    assert_eq!(block.id(), 0);
    let block = cf.log.create_block().await.unwrap();
    assert_eq!(block.id(), 1);
}

#[tokio::test]
async fn unanswered_delete_does_not_stop_allocation() {
    let sim = SimulatedCrazyflie::new();
    let cf = connect(&sim).await;

    let block = cf.log.create_block().await.unwrap();
    drop(block);

    // Every attempt of the delete is lost
    sim.configure(|fw| fw.drop_next = 4);
    let second = cf.log.create_block().await.unwrap();
    assert_eq!(second.id(), 1);
    assert!(sim.log_block(0).is_some());

    // The delete is retried with the next allocation
    let third = cf.log.create_block().await.unwrap();
    assert_eq!(third.id(), 0);
    assert!(sim.log_block(1).is_some());
}

#[test]
fn log_period_range() {
    assert!(LogPeriod::from_millis(10).is_ok());
    assert!(LogPeriod::from_millis(2550).is_ok());
    assert!(LogPeriod::from_millis(5).is_err());
    assert!(LogPeriod::try_from(Duration::from_secs(3)).is_err());
}
