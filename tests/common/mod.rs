#![allow(dead_code)]

use lungseg::error::Result;
use lungseg::image::{self, PixelType, Volume};
use lungseg::models::ArchiveFetcher;
use lungseg::pipeline::{PredictionRequest, Predictor};
use rand::Rng;
use std::cell::Cell;
use std::fs;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::ZipWriter;

pub const BASE_URL: &str = "https://models.test/v1";

/// Serves one model archive and counts how often it was asked to
pub struct MockFetcher {
    archive: Vec<u8>,
    pub calls: Cell<usize>,
}

impl MockFetcher {
    pub fn new(file_ending: &str) -> Self {
        Self {
            archive: model_archive(file_ending),
            calls: Cell::new(0),
        }
    }
}

impl ArchiveFetcher for MockFetcher {
    fn fetch(&self, _url: &str, dest: &Path) -> Result<u64> {
        self.calls.set(self.calls.get() + 1);
        fs::write(dest, &self.archive)?;
        Ok(self.archive.len() as u64)
    }
}

/// Zip laid out like an nnUNet results export
pub fn model_archive(file_ending: &str) -> Vec<u8> {
    let dataset = format!(
        r#"{{
            "channel_names": {{ "0": "CT" }},
            "labels": {{ "background": 0, "lung": 1 }},
            "file_ending": "{file_ending}",
            "name": "Dataset101_InvivoParenchyma"
        }}"#
    );
    let folder = "Dataset101_InvivoParenchyma/nnUNetTrainer__nnUNetPlans__3d_fullres";

    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(format!("{folder}/dataset.json"), FileOptions::default())
        .unwrap();
    writer.write_all(dataset.as_bytes()).unwrap();
    writer
        .start_file(format!("{folder}/plans.json"), FileOptions::default())
        .unwrap();
    writer.write_all(b"{}").unwrap();
    writer
        .start_file(format!("{folder}/fold_0/checkpoint_final.pth"), FileOptions::default())
        .unwrap();
    writer.write_all(b"weights").unwrap();
    writer.finish().unwrap().into_inner()
}

/// Thresholds the staged scan into a mask, like a (very) small nnUNet
#[derive(Default)]
pub struct ThresholdPredictor {
    pub calls: Cell<usize>,
}

impl Predictor for ThresholdPredictor {
    fn predict(&self, request: &PredictionRequest) -> Result<()> {
        self.calls.set(self.calls.get() + 1);

        let staged: Vec<_> = fs::read_dir(&request.staging_dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(staged.len(), 1, "staging dir must hold one case");
        let input = &staged[0];
        let name = input.file_name().unwrap().to_str().unwrap();
        let ext = name.strip_prefix("001_0000").expect("nnUNet case naming");

        let scan = image::read(input)?;
        let size = scan.pixel.size();
        let mask = Volume {
            pixel: PixelType::U8,
            data: scan
                .data
                .chunks_exact(size)
                .map(|v| u8::from(v[size - 1] & 0x80 == 0))
                .collect(),
            ..scan
        };
        image::write(&mask, &request.output_dir.join(format!("001{ext}")))?;

        for side in ["dataset.json", "plans.json", "predict_from_raw_data_args.json"] {
            fs::write(request.output_dir.join(side), b"{}")?;
        }
        Ok(())
    }
}

/// Fails the way nnUNet does when the GPU is out of memory
pub struct FailingPredictor;

impl Predictor for FailingPredictor {
    fn predict(&self, _request: &PredictionRequest) -> Result<()> {
        Err(lungseg::LungsegError::Prediction(
            "torch.OutOfMemoryError: CUDA out of memory".to_string(),
        ))
    }
}

/// Reports success without writing anything
pub struct SilentPredictor;

impl Predictor for SilentPredictor {
    fn predict(&self, _request: &PredictionRequest) -> Result<()> {
        Ok(())
    }
}

/// A small CT-like scan with oblique geometry
pub fn ct_volume() -> Volume {
    let dims = vec![8, 7, 5];
    let mut rng = rand::thread_rng();
    let data = (0..dims.iter().product::<usize>())
        .flat_map(|_| rng.gen_range(-1024i16..=1500).to_le_bytes())
        .collect();
    let (s, c) = 12f64.to_radians().sin_cos();
    Volume {
        dims,
        pixel: PixelType::I16,
        spacing: vec![0.7, 0.7, 1.25],
        origin: vec![-180.0, -175.5, 42.0],
        direction: vec![c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c],
        data,
    }
}

pub fn file_names(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
