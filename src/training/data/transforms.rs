//! Image transforms for training augmentation and evaluation
//!
//! Transforms operate on [`RgbImage`] and draw randomness from the caller's
//! [`StdRng`], so a sample's augmentation depends only on how that rng was
//! seeded. [`Compose`] chains them and finishes with [`ToTensor`].
//!
//! # Chains
//!
//! - **Training**: resize, flips, gaussian blur, rotation, affine
//! - **Evaluation**: resize only

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::Rng;

/// A single image-to-image transform
pub trait Transform: Send + Sync {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage;

    fn name(&self) -> &'static str;
}

/// Resize to an exact `size x size` square with bilinear filtering
#[derive(Debug, Clone)]
pub struct Resize {
    pub size: u32,
}

impl Transform for Resize {
    fn apply(&self, image: RgbImage, _rng: &mut StdRng) -> RgbImage {
        if image.width() == self.size && image.height() == self.size {
            return image;
        }
        imageops::resize(&image, self.size, self.size, FilterType::Triangle)
    }

    fn name(&self) -> &'static str {
        "Resize"
    }
}

/// Mirror left-right with probability `p`
#[derive(Debug, Clone)]
pub struct RandomHorizontalFlip {
    pub p: f64,
}

impl Transform for RandomHorizontalFlip {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage {
        if rng.random_bool(self.p) {
            imageops::flip_horizontal(&image)
        } else {
            image
        }
    }

    fn name(&self) -> &'static str {
        "RandomHorizontalFlip"
    }
}

/// Mirror top-bottom with probability `p`
#[derive(Debug, Clone)]
pub struct RandomVerticalFlip {
    pub p: f64,
}

impl Transform for RandomVerticalFlip {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage {
        if rng.random_bool(self.p) {
            imageops::flip_vertical(&image)
        } else {
            image
        }
    }

    fn name(&self) -> &'static str {
        "RandomVerticalFlip"
    }
}

/// Gaussian blur with a fixed `(width, height)` kernel and a sigma drawn
/// uniformly from `sigma` on every call
#[derive(Debug, Clone)]
pub struct GaussianBlur {
    pub kernel_size: (usize, usize),
    pub sigma: (f32, f32),
}

impl Transform for GaussianBlur {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage {
        let sigma = rng.random_range(self.sigma.0..=self.sigma.1);
        let kx = gaussian_kernel(self.kernel_size.0, sigma);
        let ky = gaussian_kernel(self.kernel_size.1, sigma);
        blur_separable(&image, &kx, &ky)
    }

    fn name(&self) -> &'static str {
        "GaussianBlur"
    }
}

/// Rotate about the centre by an angle drawn from `degrees`
#[derive(Debug, Clone)]
pub struct RandomRotation {
    pub degrees: (f32, f32),
}

impl Transform for RandomRotation {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage {
        let angle = rng.random_range(self.degrees.0..=self.degrees.1);
        warp(&image, angle, (0.0, 0.0), 1.0)
    }

    fn name(&self) -> &'static str {
        "RandomRotation"
    }
}

/// Random rotation, translation and scale about the centre
///
/// `translate` holds the maximum horizontal and vertical shift as fractions of
/// the image width and height.
#[derive(Debug, Clone)]
pub struct RandomAffine {
    pub degrees: (f32, f32),
    pub translate: (f32, f32),
    pub scale: (f32, f32),
}

impl Transform for RandomAffine {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage {
        let angle = rng.random_range(self.degrees.0..=self.degrees.1);
        let max_dx = self.translate.0 * image.width() as f32;
        let max_dy = self.translate.1 * image.height() as f32;
        let tx = rng.random_range(-max_dx..=max_dx).round();
        let ty = rng.random_range(-max_dy..=max_dy).round();
        let scale = rng.random_range(self.scale.0..=self.scale.1);
        warp(&image, angle, (tx, ty), scale)
    }

    fn name(&self) -> &'static str {
        "RandomAffine"
    }
}

/// Convert to a CHW `f32` buffer scaled into `[0, 1]`
#[derive(Debug, Clone, Default)]
pub struct ToTensor;

impl ToTensor {
    pub fn apply(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let plane = width * height;
        let mut pixels = vec![0f32; 3 * plane];

        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for c in 0..3 {
                pixels[c * plane + offset] = pixel[c] as f32 / 255.0;
            }
        }
        pixels
    }
}

/// An ordered chain of transforms ending in [`ToTensor`]
pub struct Compose {
    steps: Vec<Box<dyn Transform>>,
    to_tensor: ToTensor,
}

impl Compose {
    pub fn new(steps: Vec<Box<dyn Transform>>) -> Self {
        Self {
            steps,
            to_tensor: ToTensor,
        }
    }

    /// Training augmentation chain
    pub fn augmentation(image_size: u32) -> Self {
        Self::new(vec![
            Box::new(Resize { size: image_size }),
            Box::new(RandomHorizontalFlip { p: 0.5 }),
            Box::new(RandomVerticalFlip { p: 0.5 }),
            Box::new(GaussianBlur {
                kernel_size: (3, 9),
                sigma: (0.1, 2.0),
            }),
            Box::new(RandomRotation { degrees: (0.0, 180.0) }),
            Box::new(RandomAffine {
                degrees: (30.0, 90.0),
                translate: (0.1, 0.3),
                scale: (0.5, 0.9),
            }),
        ])
    }

    /// Deterministic evaluation chain
    pub fn evaluation(image_size: u32) -> Self {
        Self::new(vec![Box::new(Resize { size: image_size })])
    }

    /// Run every step then convert; returns `(pixels, height, width)`
    pub fn apply(&self, image: &RgbImage, rng: &mut StdRng) -> (Vec<f32>, usize, usize) {
        let mut image = image.clone();
        for step in &self.steps {
            image = step.apply(image, rng);
        }
        let pixels = self.to_tensor.apply(&image);
        (pixels, image.height() as usize, image.width() as usize)
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Normalized 1-D gaussian of odd length `size`
pub(crate) fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let half = (size as f32 - 1.0) / 2.0;
    let weights: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f32 - half;
            (-0.5 * (x / sigma).powi(2)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Mirror an out-of-range index back into `0..len` without repeating the edge
fn reflect(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut i = index.rem_euclid(period);
    if i >= len as isize {
        i = period - i;
    }
    i as usize
}

fn blur_separable(image: &RgbImage, kx: &[f32], ky: &[f32]) -> RgbImage {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let rx = (kx.len() / 2) as isize;
    let ry = (ky.len() / 2) as isize;

    let mut horizontal = vec![[0f32; 3]; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0f32; 3];
            for (k, w) in kx.iter().enumerate() {
                let sx = reflect(x as isize + k as isize - rx, width);
                let p = image.get_pixel(sx as u32, y as u32);
                for c in 0..3 {
                    acc[c] += w * p[c] as f32;
                }
            }
            horizontal[y * width + x] = acc;
        }
    }

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let mut acc = [0f32; 3];
        for (k, w) in ky.iter().enumerate() {
            let sy = reflect(y as isize + k as isize - ry, height);
            let p = horizontal[sy * width + x as usize];
            for c in 0..3 {
                acc[c] += w * p[c];
            }
        }
        Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}

/// Rotate by `angle` degrees (counter-clockwise), scale and translate about the
/// image centre. Each output pixel takes its nearest source pixel; pixels that
/// map outside the source are black.
pub(crate) fn warp(image: &RgbImage, angle: f32, translate: (f32, f32), scale: f32) -> RgbImage {
    let (width, height) = (image.width(), image.height());
    let (cx, cy) = (width as f32 * 0.5, height as f32 * 0.5);
    let (sin, cos) = angle.to_radians().sin_cos();

    RgbImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 + 0.5 - cx - translate.0) / scale;
        let dy = (y as f32 + 0.5 - cy - translate.1) / scale;
        let sx = (cos * dx - sin * dy + cx).floor();
        let sy = (sin * dx + cos * dy + cy).floor();

        if sx >= 0.0 && sy >= 0.0 && (sx as u32) < width && (sy as u32) < height {
            *image.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0, 0, 0])
        }
    })
}
