//! Face preparation between the locator and the extractor: picking one face
//! per enrollment image, cropping, resizing and thumbnail encoding.

use crate::types::BoundingBox;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageError, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_THUMBNAIL_QUALITY: u8 = 95;

/// Which face to enroll when the locator finds several in one image.
///
/// Ties always resolve to the earliest face in detection order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceSelection {
    /// First face the locator returned.
    #[default]
    First,
    /// Face with the largest bounding-box area.
    Largest,
    /// Face with the highest detector confidence.
    Confident,
}

impl FaceSelection {
    pub fn select<'a>(&self, faces: &'a [BoundingBox]) -> Option<&'a BoundingBox> {
        match self {
            Self::First => faces.first(),
            Self::Largest => earliest_max_by(faces, BoundingBox::area),
            Self::Confident => earliest_max_by(faces, |f| f.confidence),
        }
    }
}

fn earliest_max_by(faces: &[BoundingBox], key: impl Fn(&BoundingBox) -> f32) -> Option<&BoundingBox> {
    faces
        .iter()
        .reduce(|best, face| if key(face) > key(best) { face } else { best })
}

impl fmt::Display for FaceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::First => "first",
            Self::Largest => "largest",
            Self::Confident => "confident",
        })
    }
}

impl FromStr for FaceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "largest" => Ok(Self::Largest),
            "confident" => Ok(Self::Confident),
            other => Err(format!(
                "unknown face selection {other:?} (expected first, largest or confident)"
            )),
        }
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    image::load_from_memory(bytes).map(DynamicImage::into_rgb8)
}

/// Crop the face region, clamped to the image. `None` if nothing overlaps.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (width, height) = (image.width() as f32, image.height() as f32);

    let x0 = face.x.max(0.0).floor();
    let y0 = face.y.max(0.0).floor();
    let x1 = (face.x + face.width).min(width).ceil();
    let y1 = (face.y + face.height).min(height).ceil();

    if !(x1 > x0 && y1 > y0) {
        return None;
    }

    let view = imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    Some(view.to_image())
}

/// Resize a face crop to the extractor's square input size.
pub fn normalize_face(crop: &RgbImage, size: u32) -> RgbImage {
    if crop.dimensions() == (size, size) {
        return crop.clone();
    }
    imageops::resize(crop, size, size, FilterType::Triangle)
}

/// Encode a face as a grayscale JPEG, base64 encoded for transport.
pub fn encode_thumbnail(face: &RgbImage, quality: u8) -> Result<String, ImageError> {
    let gray = imageops::grayscale(face);
    let mut jpeg = Vec::new();
    gray.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, quality))?;
    Ok(STANDARD.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb};

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_selection_first() {
        let faces = vec![bbox(0.0, 0.0, 10.0, 10.0, 0.6), bbox(20.0, 0.0, 40.0, 40.0, 0.9)];
        assert_eq!(FaceSelection::First.select(&faces), Some(&faces[0]));
        assert_eq!(FaceSelection::First.select(&[]), None);
    }

    #[test]
    fn test_selection_largest_ties_keep_earliest() {
        let faces = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(20.0, 0.0, 20.0, 20.0, 0.6),
            bbox(50.0, 0.0, 20.0, 20.0, 0.7),
        ];
        assert_eq!(FaceSelection::Largest.select(&faces), Some(&faces[1]));
    }

    #[test]
    fn test_selection_confident() {
        let faces = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.6),
            bbox(20.0, 0.0, 20.0, 20.0, 0.95),
            bbox(50.0, 0.0, 30.0, 30.0, 0.95),
        ];
        assert_eq!(FaceSelection::Confident.select(&faces), Some(&faces[1]));
    }

    #[test]
    fn test_selection_parse_and_display() {
        for policy in [FaceSelection::First, FaceSelection::Largest, FaceSelection::Confident] {
            assert_eq!(policy.to_string().parse::<FaceSelection>(), Ok(policy));
        }
        assert_eq!(" Largest ".parse::<FaceSelection>(), Ok(FaceSelection::Largest));
        assert!("biggest".parse::<FaceSelection>().is_err());
    }

    #[test]
    fn test_crop_clamps_to_image() {
        let image = RgbImage::from_pixel(100, 80, Rgb([10, 20, 30]));
        let crop = crop_face(&image, &bbox(-10.0, 60.0, 30.0, 50.0, 0.9)).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
    }

    #[test]
    fn test_crop_outside_image_is_none() {
        let image = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        assert!(crop_face(&image, &bbox(60.0, 0.0, 10.0, 10.0, 0.9)).is_none());
        assert!(crop_face(&image, &bbox(10.0, 10.0, 0.0, 10.0, 0.9)).is_none());
    }

    #[test]
    fn test_crop_takes_face_pixels() {
        let mut image = RgbImage::from_pixel(40, 20, Rgb([0, 0, 0]));
        for y in 0..20 {
            for x in 20..40 {
                image.put_pixel(x, y, Rgb([200, 10, 10]));
            }
        }
        let crop = crop_face(&image, &bbox(20.0, 0.0, 20.0, 20.0, 0.9)).unwrap();
        assert!(crop.pixels().all(|p| *p == Rgb([200, 10, 10])));
    }

    #[test]
    fn test_normalize_face_size() {
        let crop = RgbImage::from_pixel(37, 51, Rgb([1, 2, 3]));
        assert_eq!(normalize_face(&crop, 112).dimensions(), (112, 112));
    }

    #[test]
    fn test_thumbnail_is_grayscale_jpeg() {
        let face = RgbImage::from_pixel(32, 32, Rgb([200, 40, 40]));
        let encoded = encode_thumbnail(&face, DEFAULT_THUMBNAIL_QUALITY).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (32, 32));
        assert_eq!(decoded.color(), image::ColorType::L8);
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(decode_image(b"definitely not an image").is_err());
    }
}
