//! Format conversion.
//!
//! The platform rejects some container formats outright. Files with one of
//! the configured extensions are re-encoded to JPEG at the configured
//! quality before upload; everything else passes through untouched. The
//! pixel work runs on the blocking pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::ImageReader;
use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::model::ErrorKind;

use super::{Converter, StepError, StepResult};

pub struct JpegConverter {
    quality: u8,
}

impl JpegConverter {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    fn encode(source: &Path, target: &Path, quality: u8) -> StepResult<()> {
        let img = ImageReader::open(source)
            .map_err(|e| StepError::new(ErrorKind::InvalidInput, format!("open: {e}")))?
            .with_guessed_format()
            .map_err(|e| StepError::new(ErrorKind::InvalidInput, format!("sniff: {e}")))?
            .decode()
            .map_err(|e| StepError::new(ErrorKind::InvalidInput, format!("decode: {e}")))?;

        let file = std::fs::File::create(target)
            .map_err(|e| StepError::new(ErrorKind::Internal, format!("create: {e}")))?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
        img.to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| StepError::new(ErrorKind::Internal, format!("encode: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Converter for JpegConverter {
    async fn convert(&self, file: &Path) -> StepResult<PathBuf> {
        let target = file.with_extension("jpg");
        if target == file {
            return Ok(target);
        }

        let source = file.to_path_buf();
        let dest = target.clone();
        let quality = self.quality;
        tokio::task::spawn_blocking(move || Self::encode(&source, &dest, quality))
            .await
            .map_err(|e| StepError::new(ErrorKind::Internal, format!("convert task: {e}")))??;

        debug!(from = %file.display(), to = %target.display(), "re-encoded for upload");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreadable_input_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("not-an-image.bmp");
        std::fs::write(&bogus, b"definitely not pixels").unwrap();

        let err = JpegConverter::new(90).convert(&bogus).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn produces_a_jpeg_next_to_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tiny.png");
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 40, 40]));
        img.save(&source).unwrap();

        let converted = JpegConverter::new(90).convert(&source).await.unwrap();
        assert_eq!(converted, dir.path().join("tiny.jpg"));
        assert!(converted.exists());
        // Round-trips as a decodable JPEG.
        assert!(ImageReader::open(&converted).unwrap().decode().is_ok());
    }
}
