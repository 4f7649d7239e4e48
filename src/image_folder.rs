//! Directory-backed image classification dataset.
//!
//! ```text
//! root/
//!   boots/
//!     0001.jpg
//!     nested/0002.jpg
//!   sandals/
//!     0003.png
//! ```
//!
//! Labels are the sorted names of the root's immediate subdirectories.
//! Each class directory is walked down to `max_depth`.

use std::path::{ Path, PathBuf };

use log::{ debug, info };
use rand::seq::SliceRandom;
use rand::Rng;
use tch::{ Tensor, Kind };
use walkdir::WalkDir;

use crate::configs::MAX_DEPTH;
use crate::error::{ Error, Result };
use crate::transform::{ Pipeline, Transform };


const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub batch_size: usize,
    pub shuffle: bool,
}


pub struct ImageFolderBuilder {
    root: Option<PathBuf>,
    max_depth: usize,
    pipeline: Pipeline,
    sampling: Option<Sampling>,
}

impl ImageFolderBuilder {
    pub fn set_repository_path<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = Some(root.as_ref().to_path_buf());
        self
    }

    pub fn opt_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn add_transform<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.pipeline.add(Box::new(transform));
        self
    }

    pub fn set_sampling(mut self, batch_size: usize, shuffle: bool) -> Self {
        self.sampling = Some(Sampling { batch_size, shuffle });
        self
    }

    pub fn build(self) -> Result<ImageFolder> {
        let root = self.root.ok_or_else(|| Error::Config("dataset repository path not set".to_string()))?;
        let sampling = self.sampling.ok_or_else(|| Error::Config("dataset sampling not set".to_string()))?;
        if sampling.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        if self.pipeline.is_empty() {
            return Err(Error::Config("dataset needs at least one transform".to_string()));
        }
        Ok(ImageFolder {
            root,
            max_depth: self.max_depth,
            pipeline: self.pipeline,
            sampling,
            synsets: Vec::new(),
            items: Vec::new(),
            prepared: false,
        })
    }
}


#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    max_depth: usize,
    pipeline: Pipeline,
    sampling: Sampling,
    synsets: Vec<String>,
    items: Vec<(PathBuf, i64)>,     // (image path, class index)
    prepared: bool,
}


impl ImageFolder {
    pub fn builder() -> ImageFolderBuilder {
        ImageFolderBuilder {
            root: None,
            max_depth: MAX_DEPTH,
            pipeline: Pipeline::new(),
            sampling: None,
        }
    }

    /// Indexes the directory tree. Must run before the dataset is split or sampled.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }

        let mut synsets = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            let file_type = entry.file_type().map_err(|e| Error::io(entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            // Labels are reported by name, so every class directory must have one.
            match entry.file_name().into_string() {
                Ok(name) => synsets.push(name),
                Err(_) => return Err(Error::Dataset(format!(
                    "class directory {:?} does not have a UTF-8 name", entry.path()
                ))),
            }
        }
        synsets.sort();

        if synsets.is_empty() {
            return Err(Error::Dataset(format!("no class directories under {:?}", self.root)));
        }

        let mut items = Vec::new();
        for (label, synset) in synsets.iter().enumerate() {
            let class_dir = self.root.join(synset);
            let before = items.len();
            for entry in WalkDir::new(&class_dir).max_depth(self.max_depth).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| class_dir.clone());
                    Error::io(path, e.into())
                })?;
                if entry.file_type().is_file() && is_image(entry.path()) {
                    items.push((entry.into_path(), label as i64));
                }
            }
            debug!("Class '{}' (label {}): {} images", synset, label, items.len() - before);
        }

        if items.is_empty() {
            return Err(Error::Dataset(format!("no images found under {:?}", self.root)));
        }

        info!("Prepared {:?}: {} classes, {} images, transforms {:?}", self.root, synsets.len(), items.len(), self.pipeline);
        self.synsets = synsets;
        self.items = items;
        self.prepared = true;
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn synsets(&self) -> &[String] {
        &self.synsets
    }

    pub fn sampling(&self) -> Sampling {
        self.sampling
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn path_of(&self, index: usize) -> &Path {
        &self.items[index].0
    }

    pub fn label_of(&self, index: usize) -> i64 {
        self.items[index].1
    }

    /// Decodes the image at `index` and runs it through the transform chain.
    pub fn get(&self, index: usize) -> Result<(Tensor, i64)> {
        let (path, label) = self.items.get(index)
            .ok_or_else(|| Error::Dataset(format!("index {} out of range for {} images", index, self.items.len())))?;
        let img = image::open(path).map_err(|e| Error::translate(path, e))?;
        let tensor = self.pipeline.apply(img, path)?;
        Ok((tensor, *label))
    }

    /// Shuffles all indices and cuts them into one contiguous piece per weight.
    /// Piece `i` gets `floor(len * w_i / sum)` items, the last piece takes the remainder.
    pub fn random_split<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Result<Vec<Subset<'_>>> {
        if !self.prepared {
            return Err(Error::Dataset("dataset must be prepared before it is split".to_string()));
        }
        if weights.len() < 2 || weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(Error::Config(format!("invalid split weights {:?}", weights)));
        }

        let total = self.items.len();
        let sum: f64 = weights.iter().sum();
        let mut indices: Vec<usize> = (0..total).collect();
        indices.shuffle(rng);

        let mut subsets = Vec::with_capacity(weights.len());
        let mut start = 0;
        for (idx, w) in weights.iter().enumerate() {
            let end = match idx == weights.len() - 1 {
                true => total,
                false => (start + (total as f64 * w / sum).floor() as usize).min(total),
            };
            subsets.push(Subset { folder: self, indices: indices[start..end].to_vec() });
            start = end;
        }
        Ok(subsets)
    }

    /// The whole prepared dataset as a single subset.
    pub fn all(&self) -> Subset<'_> {
        Subset { folder: self, indices: (0..self.items.len()).collect() }
    }
}


pub struct Batch {
    pub images: Tensor,     // [B, C, H, W]
    pub labels: Tensor,     // [B], int64
}

impl Batch {
    pub fn size(&self) -> usize {
        self.labels.size()[0] as usize
    }
}


#[derive(Debug, Clone)]
pub struct Subset<'a> {
    folder: &'a ImageFolder,
    indices: Vec<usize>,
}

impl<'a> Subset<'a> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn folder(&self) -> &'a ImageFolder {
        self.folder
    }

    pub fn num_batches(&self) -> usize {
        let bs = self.folder.sampling.batch_size;
        (self.indices.len() + bs - 1) / bs
    }

    /// Batches in the folder's sampling order. The final batch may be short.
    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Batches<'a> {
        let mut order = self.indices.clone();
        if self.folder.sampling.shuffle {
            order.shuffle(rng);
        }
        Batches { folder: self.folder, order, cursor: 0 }
    }
}


pub struct Batches<'a> {
    folder: &'a ImageFolder,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.folder.sampling.batch_size).min(self.order.len());
        let chunk = &self.order[self.cursor..end];
        self.cursor = end;

        let mut images = Vec::with_capacity(chunk.len());
        let mut labels = Vec::with_capacity(chunk.len());
        for &idx in chunk {
            match self.folder.get(idx) {
                Ok((img, label)) => {
                    images.push(img);
                    labels.push(label);
                },
                Err(e) => {
                    self.cursor = self.order.len();
                    return Some(Err(e));
                },
            }
        }
        Some(Ok(Batch {
            images: Tensor::stack(&images, 0),
            labels: Tensor::of_slice(&labels).to_kind(Kind::Int64),
        }))
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{ Resize, ToTensor };
    use image::{ Rgb, RgbImage };
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn write_image(path: &Path, shade: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(12, 9, Rgb([shade, 0, 255 - shade])).save(path).unwrap();
    }

    fn folder(root: &Path, batch_size: usize) -> ImageFolder {
        ImageFolder::builder()
            .set_repository_path(root)
            .add_transform(Resize::new(8, 8))
            .add_transform(ToTensor)
            .set_sampling(batch_size, true)
            .build()
            .unwrap()
    }

    #[test]
    fn prepare_discovers_sorted_labels_and_nested_images() {
        let dir = TempDir::new().unwrap();
        write_image(&dir.path().join("sandals/a.png"), 10);
        write_image(&dir.path().join("boots/b.png"), 20);
        write_image(&dir.path().join("boots/deep/c.jpg"), 30);
        std::fs::write(dir.path().join("boots/notes.txt"), "not an image").unwrap();
        std::fs::write(dir.path().join("README"), "ignored").unwrap();

        let mut ds = folder(dir.path(), 2);
        ds.prepare().unwrap();
        assert_eq!(ds.synsets(), &["boots".to_string(), "sandals".to_string()]);
        assert_eq!(ds.len(), 3);
        let labels: Vec<i64> = (0..ds.len()).map(|i| ds.label_of(i)).collect();
        assert_eq!(labels, vec![0, 0, 1]);
    }

    #[test]
    fn max_depth_limits_traversal() {
        let dir = TempDir::new().unwrap();
        write_image(&dir.path().join("boots/a.png"), 10);
        write_image(&dir.path().join("boots/x/y/b.png"), 10);

        let mut ds = ImageFolder::builder()
            .set_repository_path(dir.path())
            .opt_max_depth(1)
            .add_transform(ToTensor)
            .set_sampling(1, false)
            .build()
            .unwrap();
        ds.prepare().unwrap();
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let mut ds = folder(&dir.path().join("nope"), 2);
        assert!(ds.prepare().unwrap_err().is_io());
    }

    #[test]
    fn empty_classes_are_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("boots")).unwrap();
        let mut ds = folder(dir.path(), 2);
        assert!(matches!(ds.prepare(), Err(Error::Dataset(_))));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_class_directory_is_a_dataset_error() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        write_image(&dir.path().join("boots/a.png"), 10);
        write_image(&dir.path().join(OsStr::from_bytes(b"sand\xffals")).join("b.png"), 20);

        let mut ds = folder(dir.path(), 2);
        let err = ds.prepare().unwrap_err();
        assert!(matches!(err, Error::Dataset(_)), "{}", err);
        assert!(ds.synsets().is_empty());
    }

    #[test]
    fn split_requires_prepare() {
        let dir = TempDir::new().unwrap();
        let ds = folder(dir.path(), 2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(ds.random_split(&[8.0, 2.0], &mut rng), Err(Error::Dataset(_))));
    }

    #[test]
    fn split_partitions_exactly_by_weight() {
        let dir = TempDir::new().unwrap();
        for i in 0..53 {
            write_image(&dir.path().join(format!("c{}/{:03}.png", i % 3, i)), i as u8);
        }
        let mut ds = folder(dir.path(), 4);
        ds.prepare().unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let parts = ds.random_split(&[8.0, 2.0], &mut rng).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 42);     // floor(53 * 0.8)
        assert_eq!(parts[1].len(), 11);

        let train: HashSet<usize> = parts[0].indices().iter().copied().collect();
        let valid: HashSet<usize> = parts[1].indices().iter().copied().collect();
        assert!(train.is_disjoint(&valid));
        assert_eq!(train.union(&valid).count(), 53);
    }

    #[test]
    fn seeded_splits_are_reproducible() {
        let dir = TempDir::new().unwrap();
        for i in 0..20 {
            write_image(&dir.path().join(format!("c{}/{:03}.png", i % 2, i)), i as u8);
        }
        let mut ds = folder(dir.path(), 4);
        ds.prepare().unwrap();

        let a = ds.random_split(&[8.0, 2.0], &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        let b = ds.random_split(&[8.0, 2.0], &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        assert_eq!(a[1].indices(), b[1].indices());
    }

    #[test]
    fn batches_stack_images_and_keep_the_short_tail() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            write_image(&dir.path().join(format!("c{}/{}.png", i % 2, i)), 40 * i as u8);
        }
        let mut ds = folder(dir.path(), 2);
        ds.prepare().unwrap();

        let all = ds.all();
        assert_eq!(all.num_batches(), 3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let batches: Vec<Batch> = all.batches(&mut rng).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].images.size(), vec![2, 3, 8, 8]);
        assert_eq!(batches[0].labels.kind(), Kind::Int64);
        assert_eq!(batches[2].size(), 1);
    }

    #[test]
    fn corrupt_image_is_a_translate_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("boots")).unwrap();
        std::fs::write(dir.path().join("boots/broken.jpg"), b"definitely not a jpeg").unwrap();
        let mut ds = folder(dir.path(), 1);
        ds.prepare().unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let first = ds.all().batches(&mut rng).next().unwrap();
        assert!(matches!(first, Err(Error::Translate { .. })));
    }
}
