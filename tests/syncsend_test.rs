// Test that the Crazyflie object can be sent and shared between threads

mod common;

use std::sync::Arc;
use std::thread::spawn;

use common::{test_config, SimulatedCrazyflie};
use crazyflie_crtp::{Crazyflie, NoTocCache};

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn crazyflie_is_send_and_sync() {
    assert_send_sync::<Crazyflie>();
}

#[tokio::test]
async fn crazyflie_can_be_sent_to_thread() -> Result<(), Box<dyn std::error::Error>> {
    let sim = SimulatedCrazyflie::new();
    let cf = Crazyflie::connect_from_link(Box::new(sim.link(true)), NoTocCache, test_config()).await?;

    let cf = spawn(move || cf).join().unwrap();
    assert!(cf.is_connected());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crazyflie_can_be_shared_between_tasks() -> Result<(), Box<dyn std::error::Error>> {
    let sim = SimulatedCrazyflie::new();
    let cf = Arc::new(
        Crazyflie::connect_from_link(Box::new(sim.link(true)), NoTocCache, test_config()).await?,
    );

    let reader = {
        let cf = cf.clone();
        tokio::spawn(async move { cf.param.get::<u8>("stabilizer.estimator").await })
    };
    let writer = {
        let cf = cf.clone();
        tokio::spawn(async move { cf.param.set("ring.effect", 1u8).await })
    };

    assert_eq!(reader.await??, 1);
    writer.await??;
    assert_eq!(sim.param_value("ring.effect"), Some(vec![1]));

    cf.disconnect().await;
    Ok(())
}
