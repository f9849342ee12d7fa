//! Per-image preprocessing as an ordered list of stages.

use rand::Rng;

use crate::dataset::{Normalization, IMAGE_CHANNELS, IMAGE_SIDE};

pub const TRAIN_PADDING: usize = 4;

/// A float CHW image.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Image {
    /// Scale CHW bytes into [0, 1].
    pub fn from_chw_bytes(channels: usize, height: usize, width: usize, bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), channels * height * width);
        Self {
            channels,
            height,
            width,
            data: bytes.iter().map(|&b| b as f32 / 255.0).collect(),
        }
    }

    pub fn cifar(bytes: &[u8]) -> Self {
        Self::from_chw_bytes(IMAGE_CHANNELS, IMAGE_SIDE, IMAGE_SIDE, bytes)
    }

    fn index(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.height + y) * self.width + x
    }

    /// Undo `Normalize` so the image can be rendered.
    pub fn denormalize(&self, norm: &Normalization) -> Image {
        let plane = self.height * self.width;
        let mut data = self.data.clone();
        for (c, chunk) in data.chunks_exact_mut(plane).enumerate() {
            for value in chunk {
                *value = *value * norm.std[c] + norm.mean[c];
            }
        }
        Image { data, ..*self }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
    /// Mirror-pad every side without repeating the border pixel.
    ReflectPad(usize),
    /// Take a uniformly placed square crop.
    RandomCrop(usize),
    /// Mirror left-right with probability one half.
    RandomHorizontalFlip,
    Normalize(Normalization),
    /// Zero `n_holes` squares of side `length`, centred uniformly and clipped to the image.
    Cutout { n_holes: usize, length: usize },
}

impl Stage {
    pub fn apply<R: Rng + ?Sized>(&self, image: Image, rng: &mut R) -> Image {
        match *self {
            Stage::ReflectPad(pad) => reflect_pad(&image, pad),
            Stage::RandomCrop(size) => random_crop(image, size, rng),
            Stage::RandomHorizontalFlip => {
                if rng.gen_bool(0.5) {
                    horizontal_flip(image)
                } else {
                    image
                }
            }
            Stage::Normalize(norm) => normalize(image, &norm),
            Stage::Cutout { n_holes, length } => cutout(image, n_holes, length, rng),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Training preprocessing: pad/crop/flip when `augment`, then normalize, then cutout.
    pub fn train(augment: bool, cutout: Option<(usize, usize)>, norm: Normalization) -> Self {
        let mut stages = Vec::with_capacity(5);
        if augment {
            stages.extend([
                Stage::ReflectPad(TRAIN_PADDING),
                Stage::RandomCrop(IMAGE_SIDE),
                Stage::RandomHorizontalFlip,
            ]);
        }
        stages.push(Stage::Normalize(norm));
        if let Some((n_holes, length)) = cutout {
            stages.push(Stage::Cutout { n_holes, length });
        }
        Self { stages }
    }

    pub fn eval(norm: Normalization) -> Self {
        Self {
            stages: vec![Stage::Normalize(norm)],
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: Image, rng: &mut R) -> Image {
        self.stages
            .iter()
            .fold(image, |image, stage| stage.apply(image, rng))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

fn reflect(index: isize, len: usize) -> usize {
    let last = len as isize - 1;
    let mut i = index;
    if i < 0 {
        i = -i;
    }
    if i > last {
        i = 2 * last - i;
    }
    i.clamp(0, last) as usize
}

fn reflect_pad(image: &Image, pad: usize) -> Image {
    if pad == 0 {
        return image.clone();
    }
    let height = image.height + 2 * pad;
    let width = image.width + 2 * pad;
    let mut data = Vec::with_capacity(image.channels * height * width);
    for c in 0..image.channels {
        for y in 0..height {
            let sy = reflect(y as isize - pad as isize, image.height);
            for x in 0..width {
                let sx = reflect(x as isize - pad as isize, image.width);
                data.push(image.data[image.index(c, sy, sx)]);
            }
        }
    }
    Image {
        channels: image.channels,
        height,
        width,
        data,
    }
}

fn random_crop<R: Rng + ?Sized>(image: Image, size: usize, rng: &mut R) -> Image {
    if image.height < size || image.width < size {
        return image;
    }
    let top = rng.gen_range(0..=image.height - size);
    let left = rng.gen_range(0..=image.width - size);

    let mut data = Vec::with_capacity(image.channels * size * size);
    for c in 0..image.channels {
        for y in top..top + size {
            let row = image.index(c, y, left);
            data.extend_from_slice(&image.data[row..row + size]);
        }
    }
    Image {
        channels: image.channels,
        height: size,
        width: size,
        data,
    }
}

fn horizontal_flip(mut image: Image) -> Image {
    let width = image.width;
    for row in image.data.chunks_exact_mut(width) {
        row.reverse();
    }
    image
}

fn normalize(mut image: Image, norm: &Normalization) -> Image {
    let plane = image.height * image.width;
    for (c, chunk) in image.data.chunks_exact_mut(plane).enumerate() {
        let (mean, std) = (norm.mean[c], norm.std[c]);
        for value in chunk {
            *value = (*value - mean) / std;
        }
    }
    image
}

fn cutout<R: Rng + ?Sized>(mut image: Image, n_holes: usize, length: usize, rng: &mut R) -> Image {
    let half = length / 2;
    for _ in 0..n_holes {
        let cy = rng.gen_range(0..image.height);
        let cx = rng.gen_range(0..image.width);
        let (y1, y2) = (cy.saturating_sub(half), (cy + half).min(image.height));
        let (x1, x2) = (cx.saturating_sub(half), (cx + half).min(image.width));

        for c in 0..image.channels {
            for y in y1..y2 {
                let start = image.index(c, y, x1);
                let end = image.index(c, y, x2);
                image.data[start..end].fill(0.0);
            }
        }
    }
    image
}
