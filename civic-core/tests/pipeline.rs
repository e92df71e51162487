use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    optim::AdamConfig,
};
use civic_core::{
    evaluate, predict, train, Artifact, AugmentConfig, DataError, EvaluateConfig, Labels,
    PredictConfig, TrainingConfig,
};
use image::{Rgb, RgbImage};
use std::path::Path;

type B = NdArray<f32>;
type AB = Autodiff<B>;

const CLASSES: [(&str, [u8; 3]); 2] = [("garbage", [190, 40, 30]), ("pothole", [40, 50, 180])];

/// Five small solid-colour PNGs per class, each with a different stripe.
fn write_dataset(root: &Path) {
    for (class, colour) in CLASSES {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..5u32 {
            let mut img = RgbImage::from_pixel(40, 40, Rgb(colour));
            for y in 0..40 {
                img.put_pixel(i * 7, y, Rgb([255, 255, 255]));
            }
            img.save(dir.join(format!("{i}.png"))).unwrap();
        }
        // not decodable, left out of the dataset
        std::fs::write(dir.join("logo.svg"), r#"<svg xmlns="http://www.w3.org/2000/svg"/>"#)
            .unwrap();
    }
}

fn tiny_training(dataset: &Path, artifact: &Path) -> TrainingConfig {
    TrainingConfig::new(
        dataset.to_path_buf(),
        artifact.to_path_buf(),
        AdamConfig::new(),
        AugmentConfig::new(),
    )
    .with_image_size(32)
    .with_batch_size(2)
    .with_num_workers(1)
    .with_frozen_epochs(1)
    .with_fine_tune_epochs(1)
    .with_hidden_size(8)
}

#[test]
fn train_evaluate_predict() {
    let tmp = tempfile::tempdir().unwrap();
    let dataset = tmp.path().join("dataset");
    let model_dir = tmp.path().join("model");
    write_dataset(&dataset);
    let device = NdArrayDevice::Cpu;

    let outcome = train::<AB>(tiny_training(&dataset, &model_dir), device).unwrap();
    assert_eq!(outcome.labels.names(), ["garbage", "pothole"]);
    assert_eq!(outcome.best_epoch, Some(1));

    let artifact = Artifact::new(&model_dir);
    assert!(artifact.model_path().with_extension("mpk").is_file());
    assert!(artifact.model_config_path().is_file());
    assert!(artifact.train_config_path().is_file());
    let trained_labels = std::fs::read_to_string(artifact.labels_path()).unwrap();
    assert_eq!(
        trained_labels,
        "{\n    \"garbage\": 0,\n    \"pothole\": 1\n}\n"
    );

    // evaluation writes its own mapping, which has to agree with training
    let eval_labels = tmp.path().join("eval_labels.json");
    let evaluation = evaluate::<B>(
        EvaluateConfig::new(dataset.clone(), model_dir.clone())
            .with_labels(Some(eval_labels.clone()))
            .with_num_workers(1),
        device,
    )
    .unwrap();
    assert_eq!(std::fs::read_to_string(&eval_labels).unwrap(), trained_labels);
    assert_eq!(evaluation.confusion_matrix.num_classes(), 2);
    assert_eq!(evaluation.confusion_matrix.total(), 2);
    assert_eq!(evaluation.report.classes.len(), 2);
    assert!((0.0..=1.0).contains(&evaluation.report.accuracy));
    assert!(evaluation.to_string().contains("weighted avg"));

    let image = dataset.join("garbage").join("0.png");
    let single = predict::<B>(PredictConfig::new(model_dir.clone(), image), device).unwrap();
    assert_eq!(single.len(), 1);
    assert!(single[0].path.is_none());
    assert!(outcome.labels.index(&single[0].label).is_some());
    assert!((0.0..=1.0).contains(&single[0].confidence));

    let listed =
        predict::<B>(PredictConfig::new(model_dir.clone(), dataset.join("pothole")), device).unwrap();
    assert_eq!(listed.len(), 5);
    assert!(listed.iter().all(|p| p.path.is_some()));

    // unreadable input is an error, not a crash in the loader
    let missing = tmp.path().join("missing.png");
    assert!(predict::<B>(PredictConfig::new(model_dir.clone(), missing), device).is_err());
    let fake = tmp.path().join("fake.png");
    std::fs::write(&fake, "not an image").unwrap();
    assert!(predict::<B>(PredictConfig::new(model_dir.clone(), fake), device).is_err());

    // a mapping that disagrees with the model is refused
    let wrong = tmp.path().join("wrong.json");
    Labels::new(vec!["a".into(), "b".into(), "c".into()])
        .save(&wrong)
        .unwrap();
    let err = predict::<B>(
        PredictConfig::new(model_dir, dataset.join("pothole")).with_labels(Some(wrong)),
        device,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DataError>(),
        Some(DataError::ClassCountMismatch {
            model: 2,
            labels: 3
        })
    ));
}

#[test]
fn training_needs_class_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let dataset = tmp.path().join("flat");
    std::fs::create_dir_all(&dataset).unwrap();
    RgbImage::new(8, 8).save(dataset.join("loose.png")).unwrap();

    let err = train::<AB>(
        tiny_training(&dataset, &tmp.path().join("model")),
        NdArrayDevice::Cpu,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DataError>(),
        Some(DataError::NoClasses(_))
    ));
}

#[test]
fn failed_training_leaves_no_configs_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let dataset = tmp.path().join("dataset");
    let model_dir = tmp.path().join("model");
    write_dataset(&dataset);

    let config = tiny_training(&dataset, &model_dir)
        .with_backbone_weights(Some(tmp.path().join("missing_weights")));
    assert!(train::<AB>(config, NdArrayDevice::Cpu).is_err());

    let artifact = Artifact::new(&model_dir);
    assert!(!artifact.model_config_path().exists());
    assert!(!artifact.train_config_path().exists());
    assert!(!artifact.labels_path().exists());
}

#[test]
fn prediction_needs_a_trained_model() {
    let tmp = tempfile::tempdir().unwrap();
    let result = predict::<B>(
        PredictConfig::new(tmp.path().join("model"), tmp.path().join("photo.png")),
        NdArrayDevice::Cpu,
    );
    assert!(result.is_err());
}
