use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, RgbImage};
use tempfile::TempDir;

use pestid_shared::{
    ClassifyError, DetectionReader, ErrorKind, ImageTensor, Locale, ModelBackend, Pipeline,
    PipelineConfig, PipelineError, RecordOrigin, SpeciesId, StorageTier,
};

/// Backend that always answers with the same distribution.
struct FixedBackend(Vec<f32>);

impl ModelBackend for FixedBackend {
    fn infer(&mut self, _tensor: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
        Ok(self.0.clone())
    }
}

/// Half the mass on `top`, the rest spread evenly.
fn peaked(classes: usize, top: usize) -> Vec<f32> {
    let rest = 0.5 / (classes - 1) as f32;
    (0..classes)
        .map(|i| if i == top { 0.5 } else { rest })
        .collect()
}

fn png_bytes(width: u32, height: u32) -> Arc<[u8]> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    Arc::from(buf)
}

fn config_in(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.database.path = dir.join("detections.db");
    config.storage.upload_root = dir.join("uploads");
    config
}

fn pipeline_with(config: &PipelineConfig, probabilities: Vec<f32>) -> Pipeline {
    Pipeline::with_backend(config, Box::new(FixedBackend(probabilities))).unwrap()
}

#[tokio::test]
async fn detect_resolves_localizes_and_records() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let pipeline = pipeline_with(&config, peaked(11, 8));

    let response = pipeline.detect(png_bytes(64, 48), "hindi").await.unwrap();

    let fruit_flies = SpeciesId::new("Fruit Flies");
    assert_eq!(response.canonical_id.as_ref(), Some(&fruit_flies));
    assert!(response.inference.resolved);
    assert_eq!(response.inference.raw_label, "Fruit Flies");
    assert!((response.confidence - 50.0).abs() < 0.01);
    assert_eq!(response.inference.all_class_scores.len(), 11);
    let total: f64 = response.inference.all_class_scores.values().sum();
    assert!((total - 100.0).abs() < 0.1);

    assert_eq!(response.view.locale_used, Locale::Hindi);
    assert_eq!(response.view.knowledge.origin, RecordOrigin::Authored);
    assert_eq!(response.view.knowledge.species_id.as_ref(), Some(&fruit_flies));

    assert_eq!(response.storage.tier(), Some(StorageTier::Local));
    let stored = response.storage.url_or_path().unwrap();
    assert!(Path::new(stored).is_relative());
    let on_disk = pipeline.reader().image_path(&response.storage).unwrap();
    assert_eq!(on_disk, config.storage.upload_root.join(stored));
    assert!(on_disk.is_file());

    let stats = pipeline.reader().stats(10).await.unwrap();
    assert_eq!(stats.counters.len(), 1);
    assert_eq!(stats.counters[0].species_id, fruit_flies);
    assert_eq!(stats.counters[0].detection_count, 1);
    assert_eq!(stats.recent.len(), 1);
    assert_eq!(stats.recent[0].id, response.detection_id);
}

#[tokio::test]
async fn stored_detection_can_be_viewed_in_another_locale() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let pipeline = pipeline_with(&config, peaked(11, 0));

    let response = pipeline.detect(png_bytes(32, 32), "english").await.unwrap();
    assert_eq!(response.view.locale_used, Locale::English);

    let bangla = pipeline.reader().view(&response.detection_id, "bangla").await.unwrap();
    assert_eq!(bangla.locale_used, Locale::Bangla);
    assert_eq!(bangla.requested_locale, "bangla");
    assert_eq!(bangla.detection_id, response.detection_id);
    assert_ne!(bangla.knowledge.name, response.view.knowledge.name);

    let unknown = pipeline.reader().view(&response.detection_id, "klingon").await.unwrap();
    assert_eq!(unknown.locale_used, Locale::English);
    assert_eq!(unknown.requested_locale, "klingon");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_detections_beyond_decode_slots_all_succeed() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let requests = config.preprocess.max_concurrent_ops * 4;
    let pipeline = Arc::new(pipeline_with(&config, peaked(11, 5)));

    let mut handles = Vec::new();
    for _ in 0..requests {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.detect(png_bytes(512, 512), "english").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stats = pipeline.reader().stats(100).await.unwrap();
    assert_eq!(stats.recent.len(), requests);
    assert_eq!(stats.counters.len(), 1);
    assert_eq!(stats.counters[0].species_id, SpeciesId::new("Cabbage Loopers"));
    assert_eq!(stats.counters[0].detection_count, requests as u64);
}

#[tokio::test]
async fn garbage_bytes_fail_without_persisting() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let pipeline = pipeline_with(&config, peaked(11, 0));

    let err = pipeline
        .detect(Arc::from(&b"definitely not an image"[..]), "english")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);

    let stats = pipeline.reader().stats(10).await.unwrap();
    assert!(stats.recent.is_empty());
    assert!(stats.counters.is_empty());
}

#[tokio::test]
async fn unnormalized_output_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let pipeline = pipeline_with(&config, vec![0.3; 11]);

    let err = pipeline.detect(png_bytes(20, 20), "english").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidModelOutput(_)));
    assert!(pipeline.reader().stats(10).await.unwrap().recent.is_empty());
}

#[tokio::test]
async fn unknown_label_gets_fallback_knowledge_and_no_counter() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(dir.path());
    let mapping = dir.path().join("class_mapping.json");
    std::fs::write(&mapping, r#"{"0": "Mystery Moth", "1": "Fruit Flies"}"#).unwrap();
    config.model.class_mapping = Some(mapping);
    let pipeline = pipeline_with(&config, vec![0.9, 0.1]);

    let response = pipeline.detect(png_bytes(24, 24), "bangla").await.unwrap();

    assert!(!response.inference.resolved);
    assert_eq!(response.view.knowledge.species_id, None);
    assert_eq!(response.canonical_id, None);
    assert_eq!(response.inference.raw_label, "Mystery Moth");
    assert_eq!(response.view.knowledge.origin, RecordOrigin::Fallback);
    assert_eq!(response.view.locale_used, Locale::English);
    assert!(response.view.knowledge.description.contains("Mystery Moth"));
    assert!(response.view.knowledge.description.contains("90.0%"));

    let stats = pipeline.reader().stats(10).await.unwrap();
    assert_eq!(stats.recent.len(), 1);
    assert!(stats.counters.is_empty());
}

#[tokio::test]
async fn unknown_detection_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let pipeline = pipeline_with(&config, peaked(11, 0));

    let err = pipeline
        .reader()
        .view(&pestid_shared::DetectionId("missing".into()), "english")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn reader_works_without_a_model() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let reader = DetectionReader::open(&config).unwrap();

    let library = reader.library("hindi");
    assert_eq!(library.len(), 11);
    assert!(library.iter().all(|record| record.locale == Locale::Hindi));
    assert_eq!(reader.library("klingon")[0].locale, Locale::English);
}
