//! Direct channel runs through the public API, without the job server.

use potentiostat_daq::device::{ConnectOptions, IRange, MockConfig, MockDriver, Potentiostat};
use potentiostat_daq::runner::{RunState, RunnerItem};
use potentiostat_daq::techniques::{Technique, TechniqueKind};
use potentiostat_daq::DaqError;
use serde_json::json;

fn ocv() -> Technique {
    Technique::new(TechniqueKind::Ocv)
        .with("rest_time_T", 5.0)
        .and_then(|t| t.with("record_every_dE", 0.01))
        .and_then(|t| t.with("record_every_dT", 0.5))
        .unwrap()
}

#[tokio::test]
async fn stop_before_the_first_pull_yields_no_records() {
    let driver = MockDriver::default();
    let device = Potentiostat::connect(&driver, "USB0", ConnectOptions::default())
        .await
        .unwrap();
    let channel = device.get_channel(1).unwrap();

    let mut runner = channel.run_techniques(vec![ocv()]).await.unwrap();
    assert!(channel.is_busy().await.unwrap());
    runner.stop().await.unwrap();

    let mut records = 0;
    let mut cancelled = 0;
    while let Some(item) = runner.next().await {
        match item {
            Ok(RunnerItem::Data(_)) => records += 1,
            Ok(_) => {}
            Err(e) if e.is_cancellation() => cancelled += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(records, 0);
    assert_eq!(cancelled, 1);
    assert_eq!(runner.state(), RunState::Cancelled);
    assert!(!channel.is_busy().await.unwrap());

    device.close().await.unwrap();
}

#[tokio::test]
async fn sequence_records_carry_their_technique_index() {
    let driver = MockDriver::new(MockConfig {
        frames_per_technique: 3,
        ..MockConfig::default()
    });
    let device = Potentiostat::connect(&driver, "USB0", ConnectOptions::default())
        .await
        .unwrap();
    let channel = device.get_channel(2).unwrap();

    let step = |voltage: f64| json!({"voltage": voltage, "scan_rate": 10.0, "vs_initial": false});
    let cv = Technique::from_structured(&json!({
        "tech_id": "CV",
        "params": {
            "record_every_dE": 0.01,
            "average_over_dE": true,
            "n_cycles": 1,
            "begin_measuring_i": 0.5,
            "end_measuring_i": 1.0,
            "Ei": step(0.0),
            "E1": step(0.8),
            "E2": step(-0.4),
            "Ef": step(0.1)
        }
    }))
    .unwrap();
    assert_eq!(cv.kind(), TechniqueKind::Cv);
    let voltages = cv.params().value("voltage_step");
    assert_eq!(voltages.as_list().map(<[_]>::len), Some(5));

    let mut runner = channel.run_techniques(vec![ocv(), cv]).await.unwrap();
    let mut seen = Vec::new();
    while let Some(item) = runner.next().await {
        if let RunnerItem::Data(data) = item.unwrap() {
            seen.push((data.tech_index, data.data.kind()));
        }
    }
    assert_eq!(seen.len(), 6);
    assert!(seen[..3].iter().all(|&(i, k)| i == 0 && k == TechniqueKind::Ocv));
    assert!(seen[3..].iter().all(|&(i, k)| i == 1 && k == TechniqueKind::Cv));
    assert_eq!(runner.state(), RunState::Complete);

    let metadata = runner.metadata().await.unwrap();
    assert_eq!(metadata.channel, 2);
    assert_eq!(metadata.status, RunState::Complete);
    assert!(metadata.stop_time.is_some());

    device.close().await.unwrap();
}

#[tokio::test]
async fn unsupported_channel_limits_are_refused() {
    let driver = MockDriver::new(MockConfig {
        max_i_range: Some(IRange::R1mA),
        ..MockConfig::default()
    });
    let device = Potentiostat::connect(&driver, "USB0", ConnectOptions::default())
        .await
        .unwrap();
    let channel = device.get_channel(1).unwrap();

    let wide = ocv().with("I_range", IRange::R10mA).unwrap();
    let err = channel.run_techniques(vec![wide]).await.unwrap_err();
    assert!(matches!(err, DaqError::HardwareLimit(_)), "{err}");
    assert_eq!(driver.load_count(), 0);

    device.close().await.unwrap();
}
