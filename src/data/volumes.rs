//! Volume dataset and batching loader.
//!
//! Volumes are `.npy` files holding a `[depth, height, width]` array (an
//! optional leading channel dimension is accepted). Each volume is intensity
//! scaled to [0, 1] on load; training batches are random patches cropped (or
//! zero padded) out of the volumes, validation batches use deterministic
//! center crops.

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// A set of intensity-scaled volumes cropped into fixed-size patches.
pub struct VolumeDataset {
    volumes: Vec<Tensor>,
    patch_size: [i64; 3],
}

impl VolumeDataset {
    /// Loads every `*.npy` file found directly under `dir`.
    pub fn from_dir<P: AsRef<Path>>(dir: P, patch_size: [i64; 3]) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("error reading directory {:?}", dir.to_string_lossy()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "npy"))
            .collect();
        paths.sort();
        Self::from_paths(&paths, patch_size)
    }

    /// Loads the volumes listed in the `column` column of a CSV index file,
    /// resolving relative paths against the directory of the index itself.
    pub fn from_index<P: AsRef<Path>>(
        index_csv: P,
        column: &str,
        patch_size: [i64; 3],
    ) -> Result<Self> {
        let index_csv = index_csv.as_ref();
        let base = index_csv.parent().unwrap_or_else(|| Path::new("."));
        let mut reader = csv::Reader::from_reader(crate::utils::file_open(index_csv)?);
        let headers = reader.headers()?.clone();
        let column_index = headers
            .iter()
            .position(|h| h == column)
            .with_context(|| format!("column {column:?} not found in {index_csv:?}"))?;
        let mut paths = Vec::new();
        for record in reader.records() {
            let record = record?;
            let field = record
                .get(column_index)
                .with_context(|| format!("short record in {index_csv:?}"))?;
            let path = PathBuf::from(field);
            paths.push(if path.is_relative() { base.join(path) } else { path });
        }
        Self::from_paths(&paths, patch_size)
    }

    fn from_paths(paths: &[PathBuf], patch_size: [i64; 3]) -> Result<Self> {
        if patch_size.iter().any(|s| *s <= 0) {
            bail!("patch size must be positive, got {patch_size:?}")
        }
        let volumes = paths
            .iter()
            .map(|path| load_volume(path))
            .collect::<Result<Vec<_>>>()?;
        if volumes.is_empty() {
            bail!("no volumes to load")
        }
        Ok(Self { volumes, patch_size })
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn patch_size(&self) -> [i64; 3] {
        self.patch_size
    }

    /// Splits off a validation subset, shuffling the volume order with the
    /// given seed first.
    pub fn split(mut self, val_fraction: f64, seed: u64) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.volumes.shuffle(&mut rng);
        let n_val = ((self.volumes.len() as f64 * val_fraction) as usize)
            .min(self.volumes.len().saturating_sub(1));
        let val_volumes = self.volumes.split_off(self.volumes.len() - n_val);
        let patch_size = self.patch_size;
        (self, Self { volumes: val_volumes, patch_size })
    }

    /// A random patch of `patch_size` from the chosen volume.
    fn random_patch(&self, index: usize, rng: &mut StdRng) -> Tensor {
        self.patch_with(index, |len, patch| {
            if len > patch {
                rng.gen_range(0..=(len - patch))
            } else {
                0
            }
        })
    }

    /// The deterministic center patch from the chosen volume.
    fn center_patch(&self, index: usize) -> Tensor {
        self.patch_with(index, |len, patch| if len > patch { (len - patch) / 2 } else { 0 })
    }

    fn patch_with(&self, index: usize, mut offset: impl FnMut(i64, i64) -> i64) -> Tensor {
        let volume = pad_to_patch(&self.volumes[index], self.patch_size);
        let mut patch = volume;
        for (dim, target) in self.patch_size.iter().enumerate() {
            let spatial_dim = dim as i64 + 1;
            let len = patch.size()[spatial_dim as usize];
            patch = patch.narrow(spatial_dim, offset(len, *target), *target);
        }
        patch
    }
}

/// Zero-pads the trailing spatial dimensions of a `[1, d, h, w]` volume up
/// to the patch size where the volume is smaller, the crop-or-pad behavior
/// of the original pipeline.
fn pad_to_patch(volume: &Tensor, patch_size: [i64; 3]) -> Tensor {
    let size = volume.size();
    let mut pad = Vec::with_capacity(6);
    let mut needs_pad = false;
    // tch pad pairs run from the last dimension backwards
    for (dim, target) in patch_size.iter().enumerate().rev() {
        let len = size[dim + 1];
        let missing = (target - len).max(0);
        let left = missing / 2;
        pad.push(left);
        pad.push(missing - left);
        needs_pad |= missing > 0;
    }
    if needs_pad {
        volume.pad(pad.as_slice(), "constant", Some(0.))
    } else {
        volume.shallow_clone()
    }
}

fn load_volume(path: &Path) -> Result<Tensor> {
    let volume = Tensor::read_npy(path)
        .with_context(|| format!("error reading volume {:?}", path.to_string_lossy()))?
        .to_kind(Kind::Float);
    let volume = match *volume.size().as_slice() {
        [_, _, _] => volume.unsqueeze(0),
        [1, _, _, _] => volume,
        ref size => bail!("expected a single channel volume in {path:?}, got shape {size:?}"),
    };
    Ok(scale_intensity(&volume))
}

/// Min-max scales a volume to [0, 1]; constant volumes map to zero.
fn scale_intensity(volume: &Tensor) -> Tensor {
    let min = volume.min().double_value(&[]);
    let max = volume.max().double_value(&[]);
    if max > min {
        (volume - min) / (max - min)
    } else {
        Tensor::zeros_like(volume)
    }
}

/// Batching iterator over a [`VolumeDataset`], yielding `[B, 1, D, H, W]`
/// float tensors on the target device.
pub struct VolumeLoader {
    dataset: VolumeDataset,
    batch_size: usize,
    shuffle: bool,
    device: Device,
    indices: Vec<usize>,
    current: usize,
    rng: StdRng,
}

impl VolumeLoader {
    pub fn new(
        dataset: VolumeDataset,
        batch_size: usize,
        shuffle: bool,
        device: Device,
        seed: u64,
    ) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            device,
            indices,
            current: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reset the loader for a new epoch.
    pub fn reset(&mut self) {
        self.current = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn dataset(&self) -> &VolumeDataset {
        &self.dataset
    }
}

impl Iterator for VolumeLoader {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.indices.len() {
            return None;
        }
        let end = (self.current + self.batch_size).min(self.indices.len());
        let patches: Vec<Tensor> = self.indices[self.current..end]
            .iter()
            .map(|index| {
                if self.shuffle {
                    self.dataset.random_patch(*index, &mut self.rng)
                } else {
                    self.dataset.center_patch(*index)
                }
            })
            .collect();
        self.current = end;
        Some(Tensor::stack(&patches, 0).to_device(self.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("volgen-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_volume(dir: &Path, name: &str, size: [i64; 3]) {
        let volume = Tensor::rand([size[0], size[1], size[2]], tch::kind::FLOAT_CPU) * 100.0;
        volume.write_npy(dir.join(name)).unwrap();
    }

    #[test]
    fn patches_have_the_requested_size_and_range() {
        let dir = scratch_dir("patches");
        write_volume(&dir, "a.npy", [12, 16, 12]);
        write_volume(&dir, "b.npy", [8, 8, 8]);
        let dataset = VolumeDataset::from_dir(&dir, [8, 8, 8]).unwrap();
        assert_eq!(dataset.len(), 2);
        let mut loader = VolumeLoader::new(dataset, 2, true, Device::Cpu, 0);
        loader.reset();
        let batch = loader.next().unwrap();
        assert_eq!(batch.size(), vec![2, 1, 8, 8, 8]);
        let min: f64 = batch.min().double_value(&[]);
        let max: f64 = batch.max().double_value(&[]);
        assert!(min >= 0. && max <= 1.);
        assert!(loader.next().is_none());
    }

    #[test]
    fn small_volumes_are_padded_up_to_the_patch_size() {
        let dir = scratch_dir("padding");
        write_volume(&dir, "small.npy", [4, 6, 4]);
        let dataset = VolumeDataset::from_dir(&dir, [8, 8, 8]).unwrap();
        let patch = dataset.center_patch(0);
        assert_eq!(patch.size(), vec![1, 8, 8, 8]);
        // the padded border stays at zero
        let corner: f64 = patch.get(0).get(0).get(0).get(0).double_value(&[]);
        assert_eq!(corner, 0.);
    }

    #[test]
    fn csv_index_resolves_relative_paths() {
        let dir = scratch_dir("index");
        write_volume(&dir, "vol0.npy", [8, 8, 8]);
        write_volume(&dir, "vol1.npy", [8, 8, 8]);
        let index = dir.join("index.csv");
        std::fs::write(&index, "subject,image\ns0,vol0.npy\ns1,vol1.npy\n").unwrap();
        let dataset = VolumeDataset::from_index(&index, "image", [8, 8, 8]).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn missing_index_column_is_an_error() {
        let dir = scratch_dir("badindex");
        let index = dir.join("index.csv");
        std::fs::write(&index, "subject,label\ns0,1\n").unwrap();
        assert!(VolumeDataset::from_index(&index, "image", [8, 8, 8]).is_err());
    }

    #[test]
    fn split_keeps_every_volume_exactly_once() {
        let dir = scratch_dir("split");
        for i in 0..5 {
            write_volume(&dir, &format!("v{i}.npy"), [8, 8, 8]);
        }
        let dataset = VolumeDataset::from_dir(&dir, [8, 8, 8]).unwrap();
        let (train, val) = dataset.split(0.4, 7);
        assert_eq!(train.len(), 3);
        assert_eq!(val.len(), 2);
    }

    #[test]
    fn deterministic_loader_repeats_batches() {
        let dir = scratch_dir("deterministic");
        write_volume(&dir, "v.npy", [10, 10, 10]);
        let dataset = VolumeDataset::from_dir(&dir, [8, 8, 8]).unwrap();
        let mut loader = VolumeLoader::new(dataset, 1, false, Device::Cpu, 0);
        loader.reset();
        let a = loader.next().unwrap();
        loader.reset();
        let b = loader.next().unwrap();
        let max_err: f64 = (a - b).abs().max().double_value(&[]);
        assert_eq!(max_err, 0.);
    }
}
