use ddad_vision::config::InspectConfig;
use ddad_vision::core_modules::anomaly_map::MinMaxNormalizer;
use ddad_vision::core_modules::latent_codec::{HaarCodec, LatentCodec};
use ddad_vision::core_modules::noise_scheduler::{NoiseScheduler, ScheduleConfig, ScheduleKind};
use ddad_vision::core_modules::tensor::tensor::{Map, Tensor3};
use ddad_vision::error::InspectError;
use proptest::prelude::*;
use std::io::Write;

fn schedule_kind() -> impl Strategy<Value = ScheduleKind> {
    prop_oneof![
        Just(ScheduleKind::Linear),
        Just(ScheduleKind::ScaledLinear),
        Just(ScheduleKind::Sigmoid),
    ]
}

proptest! {
    #[test]
    fn betas_rise_and_retention_falls_for_any_valid_schedule(
        steps in 2usize..400,
        start in 1e-5f64..0.01,
        width in 1e-4f64..0.3,
        kind in schedule_kind(),
    ) {
        let scheduler = NoiseScheduler::new(&ScheduleConfig {
            trajectory_steps: steps,
            beta_start: start,
            beta_end: start + width,
            kind,
        }).unwrap();
        prop_assert_eq!(scheduler.retention(0), 1.0);
        prop_assert!(scheduler.betas().windows(2).all(|w| w[0] < w[1]));
        for t in 0..steps {
            let (now, next) = (scheduler.retention(t), scheduler.retention(t + 1));
            prop_assert!(next < now && next > 0.0);
        }
    }

    #[test]
    fn strided_levels_descend_to_zero(start in 0usize..200, skip in 1usize..40) {
        let scheduler = NoiseScheduler::new(&ScheduleConfig {
            trajectory_steps: 200,
            beta_start: 1e-4,
            beta_end: 0.02,
            kind: ScheduleKind::Linear,
        }).unwrap();
        let levels = scheduler.step_indices(start, skip).unwrap();
        prop_assert_eq!(levels[0], start);
        prop_assert_eq!(*levels.last().unwrap(), 0);
        prop_assert!(levels.windows(2).all(|w| w[0] > w[1]));
        prop_assert!(levels[1..].iter().all(|l| l % skip == 0));
    }

    #[test]
    fn lossless_haar_reconstructs_any_image(
        values in prop::collection::vec(-1.0f32..1.0, 3 * 8 * 8),
    ) {
        let image = Tensor3::from_shape_vec((3, 8, 8), values).unwrap();
        let codec = HaarCodec::new(true);
        let decoded = codec.decode(&codec.encode(&image).unwrap()).unwrap();
        for (a, b) in image.iter().zip(decoded.iter()) {
            prop_assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn normalized_maps_stay_in_unit_range(
        values in prop::collection::vec(-50.0f32..50.0, 2 * 16),
    ) {
        let maps: Vec<Map> = values
            .chunks(16)
            .map(|chunk| Map::from_shape_vec((4, 4), chunk.to_vec()).unwrap())
            .collect();
        let normalizer = MinMaxNormalizer::fit(maps.iter());
        for map in &maps {
            prop_assert!(normalizer.apply(map).iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }
}

#[test]
fn config_file_round_trips_through_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "data": {{"category": "bottle", "image_size": 32, "imput_channel": 3}},
            "model": {{"seed": 12, "test_trajectoy_steps": 80, "skip": 8, "latent": true}}
        }}"#
    )
    .unwrap();
    let config = InspectConfig::from_path(file.path()).unwrap();
    assert_eq!(config.data.category, "bottle");
    assert!(config.model.latent);
    assert_eq!(config.test_trajectory().start, 80);
}

#[test]
fn unreadable_config_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    match InspectConfig::from_path(&missing) {
        Err(InspectError::Io { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected an io error, got {other:?}"),
    }
}
