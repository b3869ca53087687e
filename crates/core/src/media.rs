use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::backend::VideoClip;

const CLIP_MAGIC: &[u8; 4] = b"VLM1";

/// Raw f32 clip container: magic, JSON header length, JSON header,
/// little-endian payload in `(frames, channels, height, width)` order.
/// Downstream encoders read this; the engine itself stays codec-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipHeader {
    pub frames: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ClipHeader {
    fn element_count(&self) -> usize {
        self.frames * self.channels * self.height * self.width
    }
}

pub fn write_clip(path: &Path, clip: &VideoClip) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }

    let (frames, channels, height, width) = clip.dim();
    let header = ClipHeader {
        frames,
        channels,
        height,
        width,
    };
    let header_json =
        serde_json::to_vec(&header).context("failed to serialize clip header")?;

    let file = File::create(path)
        .with_context(|| format!("failed to create clip file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(CLIP_MAGIC)?;
    writer.write_all(&(header_json.len() as u32).to_le_bytes())?;
    writer.write_all(&header_json)?;

    // Standard layout iterates in logical order, matching the header.
    for value in clip.iter() {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush clip file {}", path.display()))?;
    Ok(())
}

pub fn read_clip(path: &Path) -> Result<(ClipHeader, VideoClip)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open clip file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != CLIP_MAGIC {
        bail!("{} is not a clip file (bad magic)", path.display());
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let mut header_json = vec![0u8; header_len];
    reader.read_exact(&mut header_json)?;
    let header: ClipHeader =
        serde_json::from_slice(&header_json).context("failed to parse clip header")?;

    let mut payload = vec![0f32; header.element_count()];
    let mut buf = [0u8; 4];
    for value in payload.iter_mut() {
        reader.read_exact(&mut buf)?;
        *value = f32::from_le_bytes(buf);
    }

    let clip = Array4::from_shape_vec(
        (header.frames, header.channels, header.height, header.width),
        payload,
    )
    .context("clip payload does not match header shape")?;
    Ok((header, clip))
}
