use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use tch::{ Tensor, Kind };

use crate::error::{ Error, Result };


/// Value flowing through a transform chain.
pub enum Sample {
    Image(DynamicImage),
    Tensor(Tensor),
}

impl Sample {
    fn kind(&self) -> &'static str {
        match self {
            Sample::Image(_) => "image",
            Sample::Tensor(_) => "tensor",
        }
    }
}


pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// `path` is only used to attribute failures to the source file.
    fn transform(&self, sample: Sample, path: &Path) -> Result<Sample>;
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Resize { width, height }
    }
}

impl Transform for Resize {
    fn name(&self) -> &'static str {
        "Resize"
    }

    fn transform(&self, sample: Sample, path: &Path) -> Result<Sample> {
        match sample {
            Sample::Image(img) => {
                Ok(Sample::Image(img.resize_exact(self.width, self.height, FilterType::Triangle)))
            },
            other => Err(Error::translate(path, format!("Resize expects an image, got a {}", other.kind()))),
        }
    }
}


/// HWC u8 image -> CHW float tensor in [0, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct ToTensor;

impl Transform for ToTensor {
    fn name(&self) -> &'static str {
        "ToTensor"
    }

    fn transform(&self, sample: Sample, path: &Path) -> Result<Sample> {
        let img = match sample {
            Sample::Image(img) => img.to_rgb8(),
            other => return Err(Error::translate(path, format!("ToTensor expects an image, got a {}", other.kind()))),
        };
        let (w, h) = img.dimensions();
        let hwc = Tensor::of_slice(img.as_raw()).view([h as i64, w as i64, 3]);
        let chw = hwc.permute(&[2, 0, 1]).to_kind(Kind::Float) / 255.0;
        Ok(Sample::Tensor(chw.contiguous()))
    }
}


#[derive(Default)]
pub struct Pipeline {
    transforms: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { transforms: Vec::new() }
    }

    pub fn add(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Runs every transform in insertion order. The chain must end in a tensor.
    pub fn apply(&self, img: DynamicImage, path: &Path) -> Result<Tensor> {
        let mut sample = Sample::Image(img);
        for t in self.transforms.iter() {
            sample = t.transform(sample, path)?;
        }
        match sample {
            Sample::Tensor(t) => Ok(t),
            Sample::Image(_) => Err(Error::translate(path, "transform chain did not produce a tensor")),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
