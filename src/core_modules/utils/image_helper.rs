// THEORY:
// The engine itself never touches files. This helper is the boundary where
// decoded images become tensors and tensors become PNG files again:
// - `ImageDirectorySource` walks a directory of still frames in name order
//   and yields one `Result` per file, so a frame that fails to decode can be
//   skipped without stopping the run.
// - `ImageDirectorySink` writes every emitted frame's afterimage and overlay
//   (and optionally a blend of the original with its afterimage) as numbered
//   PNG files.
// Samples are f32 in [0, 1] inside the engine and 8-bit on disk.

use crate::core_modules::afterimage::{blend, displayable};
use crate::core_modules::sequence::FrameOutput;
use crate::core_modules::tensor::{FrameShape, Tensor, clamp_unit};
use crate::error::{FrameReadError, SimulationError, SimulationResult};
use crate::pipeline::FrameSink;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// How decoded images are laid out as tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    #[default]
    Rgb,
    Luma,
}

impl ColorMode {
    pub fn channels(&self) -> usize {
        match self {
            ColorMode::Rgb => 3,
            ColorMode::Luma => 1,
        }
    }
}

/// Converts a decoded image to an H x W x C tensor with samples in [0, 1].
pub fn frame_from_image(image: &DynamicImage, mode: ColorMode) -> SimulationResult<Tensor> {
    let shape = FrameShape::new(image.height() as usize, image.width() as usize, mode.channels());
    let data = match mode {
        ColorMode::Rgb => image.to_rgb32f().into_raw(),
        ColorMode::Luma => image.to_luma32f().into_raw(),
    };
    Tensor::from_vec(shape, data)
}

pub fn load_frame(path: &Path, mode: ColorMode) -> SimulationResult<Tensor> {
    let image = image::open(path)?;
    frame_from_image(&image, mode)
}

/// Writes a 1- or 3-channel tensor as an 8-bit PNG.
pub fn save_tensor(path: &Path, tensor: &Tensor) -> SimulationResult<()> {
    let color_type = match tensor.channels() {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        other => return Err(SimulationError::UnsupportedChannels(other)),
    };
    let buffer = quantize(tensor);

    let output = BufWriter::new(fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);
    encoder.write_image(
        &buffer,
        tensor.width() as u32,
        tensor.height() as u32,
        color_type,
    )?;
    Ok(())
}

fn quantize(tensor: &Tensor) -> Vec<u8> {
    tensor
        .as_slice()
        .iter()
        .map(|&v| (clamp_unit(v) * 255.0).round() as u8)
        .collect()
}

fn is_frame_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| FRAME_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Still frames of a directory, in file name order.
#[derive(Debug)]
pub struct ImageDirectorySource {
    paths: Vec<PathBuf>,
    mode: ColorMode,
    next: usize,
}

impl ImageDirectorySource {
    pub fn open(dir: impl AsRef<Path>, mode: ColorMode) -> SimulationResult<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if is_frame_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(Self {
            paths,
            mode,
            next: 0,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Iterator for ImageDirectorySource {
    type Item = Result<Tensor, FrameReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next;
        let path = self.paths.get(index)?;
        self.next += 1;
        Some(load_frame(path, self.mode).map_err(|err| FrameReadError {
            index,
            path: path.clone(),
            reason: err.to_string(),
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.paths.len() - self.next;
        (remaining, Some(remaining))
    }
}

/// Writes emitted frames under `afterimage/`, `persistent_overlay/` and,
/// when enabled, `blended/`.
#[derive(Debug)]
pub struct ImageDirectorySink {
    root: PathBuf,
    afterimage_dir: PathBuf,
    overlay_dir: PathBuf,
    blended: Option<(PathBuf, f32)>,
}

impl ImageDirectorySink {
    pub fn new(root: impl AsRef<Path>) -> SimulationResult<Self> {
        let root = root.as_ref();
        let afterimage_dir = root.join("afterimage");
        let overlay_dir = root.join("persistent_overlay");
        fs::create_dir_all(&afterimage_dir)?;
        fs::create_dir_all(&overlay_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            afterimage_dir,
            overlay_dir,
            blended: None,
        })
    }

    /// Also writes `alpha_blend * original + (1 - alpha_blend) * afterimage`.
    pub fn with_blended(mut self, alpha_blend: f32) -> SimulationResult<Self> {
        if !(0.0..=1.0).contains(&alpha_blend) {
            return Err(SimulationError::Configuration(format!(
                "alpha_blend must be in [0, 1], got {alpha_blend}"
            )));
        }
        let dir = self.root.join("blended");
        fs::create_dir_all(&dir)?;
        self.blended = Some((dir, alpha_blend));
        Ok(self)
    }

    fn file_name(index: usize) -> String {
        format!("frame_{index:04}.png")
    }
}

impl FrameSink for ImageDirectorySink {
    fn accept(&mut self, frame: &Tensor, output: &FrameOutput) -> SimulationResult<()> {
        let name = Self::file_name(output.index);
        save_tensor(&self.afterimage_dir.join(&name), &output.afterimage)?;
        save_tensor(&self.overlay_dir.join(&name), &output.overlay)?;
        if let Some((dir, alpha_blend)) = &self.blended {
            let blended = blend(&displayable(frame), &output.afterimage, *alpha_blend)?;
            save_tensor(&dir.join(&name), &blended)?;
        }
        Ok(())
    }
}
