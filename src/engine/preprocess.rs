//! Image preprocessing for the face and text models

use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use image::imageops::FilterType;
use ndarray::Array4;
use anyhow::Result;

/// Input size for face detection (SCRFD)
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Size of an aligned face crop
pub const ALIGNED_FACE_SIZE: u32 = 112;

/// Input size for the gender-age model
pub const ATTRIBUTE_INPUT_SIZE: (u32, u32) = (96, 96);

/// Input height for text recognition
pub const REC_INPUT_HEIGHT: u32 = 48;

/// ImageNet statistics in B, G, R order, as PaddleOCR detection expects
const DET_MEAN_BGR: [f32; 3] = [0.485, 0.456, 0.406];
const DET_STD_BGR: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode image bytes and apply the EXIF orientation tag
pub fn decode_image(data: &[u8]) -> image::ImageResult<DynamicImage> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image))
}

/// Phones usually store rotation as an EXIF tag instead of rotating pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = exif::Reader::new()
        .read_from_container(&mut std::io::Cursor::new(data))
        .ok()
        .and_then(|exif_data| {
            exif_data
                .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1);

    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Letterbox to the detector size and normalize to [-1, 1] in BGR order
pub fn preprocess_for_detection(image: &DynamicImage) -> Array4<f32> {
    let (target_w, target_h) = DETECTOR_INPUT_SIZE;
    let resized = resize_with_padding(image, target_w, target_h);
    rgb_to_nchw(&resized, |r, g, b| {
        [(b - 127.5) / 128.0, (g - 127.5) / 128.0, (r - 127.5) / 128.0]
    })
}

/// Resize an aligned face for the gender-age model, RGB order, `(x - 127.5) / 128`
pub fn preprocess_for_attribute(face: &DynamicImage) -> Array4<f32> {
    let (target_w, target_h) = ATTRIBUTE_INPUT_SIZE;
    let resized = face.resize_exact(target_w, target_h, FilterType::Triangle).to_rgb8();
    rgb_to_nchw(&resized, |r, g, b| {
        [(r - 127.5) / 128.0, (g - 127.5) / 128.0, (b - 127.5) / 128.0]
    })
}

fn resize_with_padding(image: &DynamicImage, target_w: u32, target_h: u32) -> RgbImage {
    let info = ResizeInfo::new(image.dimensions(), (target_w, target_h));
    let (new_w, new_h) = info.scaled_size();

    let resized = image.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();
    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    image::imageops::replace(&mut padded, &resized, info.offset_x as i64, info.offset_y as i64);
    padded
}

/// Convert an RGB image to a `[1, 3, H, W]` tensor; `map` turns (r, g, b) into channel values
fn rgb_to_nchw(rgb: &RgbImage, map: impl Fn(f32, f32, f32) -> [f32; 3]) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let values = map(pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
        for (c, value) in values.into_iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = value;
        }
    }

    tensor
}

/// Letterbox geometry, used to map detections back to the source image
#[derive(Debug, Clone)]
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w.max(1) as f32,
            target_h as f32 / orig_h.max(1) as f32,
        );

        let new_w = ((orig_w as f32 * scale) as u32).clamp(1, target_w);
        let new_h = ((orig_h as f32 * scale) as u32).clamp(1, target_h);

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    fn scaled_size(&self) -> (u32, u32) {
        (
            ((self.original_width as f32 * self.scale) as u32).max(1),
            ((self.original_height as f32 * self.scale) as u32).max(1),
        )
    }

    /// Map model-space coordinates back to the original image
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Reference landmark positions in a 112x112 aligned face (InsightFace)
const ALIGNED_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Warp a face to the 112x112 template using its 5 landmarks
pub fn align_face(image: &DynamicImage, landmarks: &[(f32, f32); 5]) -> Result<DynamicImage> {
    let transform = similarity_transform(landmarks, &ALIGNED_LANDMARKS)?;
    Ok(warp_affine(image, &transform, ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE))
}

/// Crop a face box, clamped to the image, and scale it to the aligned face size.
/// Used when the detector gives no landmarks.
pub fn crop_face(image: &DynamicImage, bbox: (f32, f32, f32, f32)) -> Result<DynamicImage> {
    let (width, height) = image.dimensions();
    let x1 = bbox.0.clamp(0.0, width as f32) as u32;
    let y1 = bbox.1.clamp(0.0, height as f32) as u32;
    let x2 = bbox.2.clamp(0.0, width as f32).ceil() as u32;
    let y2 = bbox.3.clamp(0.0, height as f32).ceil() as u32;
    if x2 <= x1 || y2 <= y1 {
        anyhow::bail!("Empty face box, cannot crop face");
    }

    Ok(image
        .crop_imm(x1, y1, x2 - x1, y2 - y1)
        .resize_exact(ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE, FilterType::Triangle))
}

/// Least-squares similarity transform (rotation, uniform scale, translation)
/// mapping `src` onto `dst`, as a 2x3 matrix
fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Result<[[f32; 3]; 2]> {
    let n = src.len() as f32;
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (sx / n, sy / n)
    };
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut norm = 0.0f32;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 - scx, s.1 - scy);
        let (dx, dy) = (d.0 - dcx, d.1 - dcy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        norm += sx * sx + sy * sy;
    }

    if norm < 1e-6 {
        anyhow::bail!("Degenerate landmarks, cannot align face");
    }

    let a = dot / norm;
    let b = cross / norm;
    let tx = dcx - (a * scx - b * scy);
    let ty = dcy - (b * scx + a * scy);

    Ok([[a, -b, tx], [b, a, ty]])
}

/// Backward-mapped affine warp with bilinear sampling; outside pixels are black
fn warp_affine(
    image: &DynamicImage,
    transform: &[[f32; 3]; 2],
    out_width: u32,
    out_height: u32,
) -> DynamicImage {
    let rgb = image.to_rgb8();
    let mut output = ImageBuffer::from_pixel(out_width, out_height, Rgb([0u8, 0, 0]));

    let det = transform[0][0] * transform[1][1] - transform[0][1] * transform[1][0];
    if det.abs() < 1e-12 || rgb.width() < 2 || rgb.height() < 2 {
        return DynamicImage::ImageRgb8(output);
    }
    let inv = [
        [transform[1][1] / det, -transform[0][1] / det],
        [-transform[1][0] / det, transform[0][0] / det],
    ];
    let max_x = (rgb.width() - 1) as f32;
    let max_y = (rgb.height() - 1) as f32;

    for (x, y, out) in output.enumerate_pixels_mut() {
        let dx = x as f32 - transform[0][2];
        let dy = y as f32 - transform[1][2];
        let src_x = inv[0][0] * dx + inv[0][1] * dy;
        let src_y = inv[1][0] * dx + inv[1][1] * dy;

        if !(0.0..max_x).contains(&src_x) || !(0.0..max_y).contains(&src_y) {
            continue;
        }

        let (x0, y0) = (src_x as u32, src_y as u32);
        let (fx, fy) = (src_x - x0 as f32, src_y - y0 as f32);
        let p00 = rgb.get_pixel(x0, y0);
        let p10 = rgb.get_pixel(x0 + 1, y0);
        let p01 = rgb.get_pixel(x0, y0 + 1);
        let p11 = rgb.get_pixel(x0 + 1, y0 + 1);

        for c in 0..3 {
            let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
                + p10[c] as f32 * fx * (1.0 - fy)
                + p01[c] as f32 * (1.0 - fx) * fy
                + p11[c] as f32 * fx * fy;
            out[c] = v.clamp(0.0, 255.0) as u8;
        }
    }

    DynamicImage::ImageRgb8(output)
}

/// Scale factors from the text-detector input back to the source image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextResize {
    pub width: u32,
    pub height: u32,
    pub ratio_w: f32,
    pub ratio_h: f32,
}

impl TextResize {
    /// Limit the longer side to `max_side_len`, then round each side to a multiple of 32
    pub fn new(original: (u32, u32), max_side_len: u32) -> Self {
        let (w, h) = (original.0.max(1), original.1.max(1));
        let longer = w.max(h);
        let ratio = if longer > max_side_len {
            max_side_len as f32 / longer as f32
        } else {
            1.0
        };

        let round32 = |v: f32| (((v / 32.0).round() as u32) * 32).max(32);
        let width = round32(w as f32 * ratio);
        let height = round32(h as f32 * ratio);

        Self {
            width,
            height,
            ratio_w: width as f32 / w as f32,
            ratio_h: height as f32 / h as f32,
        }
    }

    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (x / self.ratio_w, y / self.ratio_h)
    }
}

/// Prepare a page image for the text detector
pub fn preprocess_for_text_detection(image: &DynamicImage, max_side_len: u32) -> (Array4<f32>, TextResize) {
    let resize = TextResize::new(image.dimensions(), max_side_len);
    let resized = image
        .resize_exact(resize.width, resize.height, FilterType::Triangle)
        .to_rgb8();

    let tensor = rgb_to_nchw(&resized, |r, g, b| {
        let bgr = [b / 255.0, g / 255.0, r / 255.0];
        [
            (bgr[0] - DET_MEAN_BGR[0]) / DET_STD_BGR[0],
            (bgr[1] - DET_MEAN_BGR[1]) / DET_STD_BGR[1],
            (bgr[2] - DET_MEAN_BGR[2]) / DET_STD_BGR[2],
        ]
    });

    (tensor, resize)
}

/// Width a text crop gets when scaled to the recognizer height
pub fn recognition_width(original: (u32, u32), max_width: u32) -> u32 {
    let (w, h) = (original.0.max(1), original.1.max(1));
    let width = (REC_INPUT_HEIGHT as f32 * w as f32 / h as f32).ceil() as u32;
    width.clamp(8, max_width.max(8))
}

/// Prepare a text-line crop for the recognizer, BGR order, `(x / 255 - 0.5) / 0.5`
pub fn preprocess_for_recognition(crop: &DynamicImage, max_width: u32) -> Array4<f32> {
    let width = recognition_width(crop.dimensions(), max_width);
    let resized = crop
        .resize_exact(width, REC_INPUT_HEIGHT, FilterType::Triangle)
        .to_rgb8();

    rgb_to_nchw(&resized, |r, g, b| {
        [(b / 255.0 - 0.5) / 0.5, (g / 255.0 - 0.5) / 0.5, (r / 255.0 - 0.5) / 0.5]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// JPEG whose left half is red and right half blue, with an optional
    /// EXIF orientation in an APP1 segment right after SOI
    fn jpeg(width: u32, height: u32, orientation: Option<u16>) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
        });
        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut encoded, image::ImageFormat::Jpeg)
            .unwrap();
        let encoded = encoded.into_inner();

        let Some(orientation) = orientation else { return encoded };
        let field = exif::Field {
            tag: exif::Tag::Orientation,
            ifd_num: exif::In::PRIMARY,
            value: exif::Value::Short(vec![orientation]),
        };
        let mut writer = exif::experimental::Writer::new();
        writer.push_field(&field);
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, false).unwrap();
        let tiff = tiff.into_inner();

        let segment_len = (2 + 6 + tiff.len()) as u16;
        let mut out = encoded[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&encoded[2..]);
        out
    }

    #[test]
    fn test_decode_applies_exif_rotation() {
        let decoded = decode_image(&jpeg(40, 20, Some(6))).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 40));

        // rotated 90 degrees clockwise: the left (red) half ends up on top
        let rgb = decoded.to_rgb8();
        let top = rgb.get_pixel(10, 5);
        let bottom = rgb.get_pixel(10, 35);
        assert!(top[0] > 200 && top[2] < 60, "top pixel {:?}", top);
        assert!(bottom[2] > 200 && bottom[0] < 60, "bottom pixel {:?}", bottom);
    }

    #[test]
    fn test_decode_upright_orientation() {
        let tagged = decode_image(&jpeg(40, 20, Some(1))).unwrap();
        assert_eq!((tagged.width(), tagged.height()), (40, 20));

        let untagged = decode_image(&jpeg(40, 20, None)).unwrap();
        assert_eq!((untagged.width(), untagged.height()), (40, 20));
    }

    #[test]
    fn test_resize_info_round_trip() {
        let info = ResizeInfo::new((1280, 640), DETECTOR_INPUT_SIZE);
        assert!((info.scale - 0.5).abs() < 1e-6);
        assert_eq!(info.offset_x, 0);
        assert_eq!(info.offset_y, 160);

        let (x, y) = info.to_original(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 320.0).abs() < 1e-3);
    }

    #[test]
    fn test_detection_tensor_shape() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 0, 0])));
        let tensor = preprocess_for_detection(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // red pixel lands in the last (R) channel, padding stays at the black value
        assert!(tensor[[0, 2, 320, 320]] > 0.9);
        assert!((tensor[[0, 2, 0, 0]] + 127.5 / 128.0).abs() < 1e-4);
    }

    #[test]
    fn test_identity_alignment() {
        let t = similarity_transform(&ALIGNED_LANDMARKS, &ALIGNED_LANDMARKS).unwrap();
        assert!((t[0][0] - 1.0).abs() < 1e-4);
        assert!(t[0][1].abs() < 1e-4);
        assert!(t[0][2].abs() < 1e-2);
        assert!(t[1][2].abs() < 1e-2);
    }

    #[test]
    fn test_scaled_alignment() {
        let src = ALIGNED_LANDMARKS.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 + 5.0));
        let t = similarity_transform(&src, &ALIGNED_LANDMARKS).unwrap();
        assert!((t[0][0] - 0.5).abs() < 1e-4);
        assert!(t[1][0].abs() < 1e-4);
        let x = t[0][0] * src[2].0 + t[0][1] * src[2].1 + t[0][2];
        assert!((x - ALIGNED_LANDMARKS[2].0).abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks() {
        assert!(similarity_transform(&[(1.0, 1.0); 5], &ALIGNED_LANDMARKS).is_err());
    }

    #[test]
    fn test_text_resize() {
        let small = TextResize::new((100, 50), 960);
        assert_eq!((small.width, small.height), (96, 64));

        let big = TextResize::new((1920, 1080), 960);
        assert_eq!(big.width, 960);
        assert_eq!(big.height, 544);
        let (x, _) = big.to_original(960.0, 0.0);
        assert!((x - 1920.0).abs() < 1e-2);
    }

    #[test]
    fn test_recognition_width() {
        assert_eq!(recognition_width((200, 48), 320), 200);
        assert_eq!(recognition_width((2000, 48), 320), 320);
        assert_eq!(recognition_width((10, 100), 320), 8);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_image(b"not an image").is_err());
    }
}
