//! Deterministic stand-ins for the ONNX models.
//!
//! Test images are rows of solid-colour vertical strips. Every non-black
//! strip is one "face"; a face's embedding is its mean colour.

use crate::detector::DetectorError;
use crate::pipeline::{EmbeddingExtractor, FaceLocator};
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};
use std::io::Cursor;

pub const STRIP_WIDTH: u32 = 16;
pub const STRIP_HEIGHT: u32 = 16;

pub const RED: [u8; 3] = [200, 0, 0];
pub const GREEN: [u8; 3] = [0, 200, 0];
pub const BLUE: [u8; 3] = [0, 0, 200];
pub const BLACK: [u8; 3] = [0, 0, 0];

/// Image with one `STRIP_WIDTH` strip per colour; no colours gives a black image.
pub fn strips(colors: &[[u8; 3]]) -> RgbImage {
    if colors.is_empty() {
        return strip_image(&[(BLACK, STRIP_WIDTH)]);
    }
    let layout: Vec<_> = colors.iter().map(|&c| (c, STRIP_WIDTH)).collect();
    strip_image(&layout)
}

/// Image made of strips with explicit widths.
pub fn strip_image(layout: &[([u8; 3], u32)]) -> RgbImage {
    let width = layout.iter().map(|(_, w)| w).sum::<u32>().max(1);
    let mut image = RgbImage::new(width, STRIP_HEIGHT);
    let mut x0 = 0;
    for &(color, w) in layout {
        for x in x0..x0 + w {
            for y in 0..STRIP_HEIGHT {
                image.put_pixel(x, y, Rgb(color));
            }
        }
        x0 += w;
    }
    image
}

/// PNG-encoded [`strips`] image.
pub fn strips_png(colors: &[[u8; 3]]) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    strips(colors)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("in-memory PNG encoding");
    out.into_inner()
}

/// Treats every maximal run of identical non-black columns as a face.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripLocator;

impl FaceLocator for StripLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut faces = Vec::new();
        let mut run: Option<(u32, Rgb<u8>)> = None;

        for x in 0..=image.width() {
            let color = (x < image.width()).then(|| *image.get_pixel(x, 0));
            if let Some((start, run_color)) = run {
                if color != Some(run_color) {
                    faces.push(BoundingBox {
                        x: start as f32,
                        y: 0.0,
                        width: (x - start) as f32,
                        height: image.height() as f32,
                        confidence: 0.9,
                    });
                    run = None;
                }
            }
            if run.is_none() {
                run = color.filter(|c| c.0 != BLACK).map(|c| (x, c));
            }
        }

        Ok(faces)
    }
}

/// Embedding = mean RGB of the crop.
#[derive(Debug, Default)]
pub struct FakeExtractor {
    calls: usize,
}

impl FakeExtractor {
    pub const INPUT_SIZE: u32 = 8;

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn embedding_of(color: [u8; 3]) -> Embedding {
        Embedding::new(color.iter().map(|&c| c as f32).collect())
    }
}

impl EmbeddingExtractor for FakeExtractor {
    fn input_size(&self) -> u32 {
        Self::INPUT_SIZE
    }

    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        self.calls += 1;
        let n = (face.width() * face.height()).max(1) as f32;
        let mut sums = [0.0f32; 3];
        for pixel in face.pixels() {
            for (sum, &c) in sums.iter_mut().zip(pixel.0.iter()) {
                *sum += c as f32;
            }
        }
        Ok(Embedding::new(sums.iter().map(|s| s / n).collect()))
    }
}
