use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use uuid::Uuid;

use facilitywatch::alerting::ThresholdEvaluator;
use facilitywatch::models::{AlertRuleInput, SensorReading};

fn bench_evaluate(c: &mut Criterion) {
    let evaluator = ThresholdEvaluator::default();
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let sensor = Uuid::new_v4();

    let mut group = c.benchmark_group("evaluate");
    for window_minutes in [15, 60, 240, 1440] {
        let rule = AlertRuleInput {
            name: None,
            asset_type_id: None,
            asset_id: None,
            sensor_type: "temperature".to_string(),
            condition: "between".to_string(),
            threshold_value: 0.0,
            threshold_value_2: Some(100.0),
            duration_minutes: Some(window_minutes),
            severity: None,
            enabled: None,
        }
        .into_rule(Uuid::new_v4())
        .unwrap();

        // One sample per minute, plus a day of history before the window
        let readings: Vec<SensorReading> = (0..i64::from(window_minutes) + 1440)
            .map(|m| SensorReading::new(sensor, 50.0 + (m % 7) as f64, start + Duration::minutes(m)))
            .collect();
        let now = readings[readings.len() - 1].timestamp;

        group.bench_with_input(
            BenchmarkId::from_parameter(window_minutes),
            &readings,
            |b, readings| b.iter(|| evaluator.evaluate(black_box(&rule), black_box(readings), now)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_evaluate);
criterion_main!(benches);
