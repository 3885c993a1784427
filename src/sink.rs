//! Image output for the `run` and `replay` commands.
//!
//! Each image's `data` dataset is written as a raw little-endian u16 file;
//! `img_num` and `frame_num` go into one JSONL index line per image.

use lpd_frame::reorder::{Dataset, DatasetValues};
use lpd_frame::{ImageSink, ReorderError, ReorderedImage};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "images.jsonl";

#[derive(Serialize)]
struct IndexEntry<'a> {
    image_counter: u64,
    frame_num: u32,
    img_num: u32,
    width: usize,
    height: usize,
    file: &'a str,
}

pub enum ImageWriter {
    /// Count and drop.
    Discard,
    Directory { dir: PathBuf, index: BufWriter<File> },
}

impl ImageWriter {
    pub fn create(dir: Option<&Path>) -> io::Result<Self> {
        let Some(dir) = dir else {
            return Ok(ImageWriter::Discard);
        };
        fs::create_dir_all(dir)?;
        let index = OpenOptions::new().create(true).append(true).open(dir.join(INDEX_FILE))?;
        Ok(ImageWriter::Directory { dir: dir.to_path_buf(), index: BufWriter::new(index) })
    }

    fn write(dir: &Path, index: &mut BufWriter<File>, image: ReorderedImage) -> io::Result<()> {
        let counter = image.image_counter;
        let (width, height) = (image.width, image.height);
        let mut frame_num = 0;
        let mut img_num = 0;
        let mut file_name = String::new();

        for dataset in image.into_datasets() {
            match dataset {
                Dataset { name: "data", values: DatasetValues::U16(pixels), .. } => {
                    file_name = format!("image_{:08}.raw", counter);
                    let mut out = BufWriter::new(File::create(dir.join(&file_name))?);
                    for px in pixels {
                        out.write_all(&px.to_le_bytes())?;
                    }
                    out.flush()?;
                }
                Dataset { name: "img_num", values: DatasetValues::U32(v), .. } => {
                    img_num = v.first().copied().unwrap_or_default();
                }
                Dataset { name: "frame_num", values: DatasetValues::U32(v), .. } => {
                    frame_num = v.first().copied().unwrap_or_default();
                }
                _ => {}
            }
        }

        let entry = IndexEntry { image_counter: counter, frame_num, img_num, width, height, file: &file_name };
        let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        writeln!(index, "{}", line)?;
        index.flush()
    }
}

impl ImageSink for ImageWriter {
    fn push(&mut self, image: ReorderedImage) -> Result<(), ReorderError> {
        match self {
            ImageWriter::Discard => Ok(()),
            ImageWriter::Directory { dir, index } => {
                let counter = image.image_counter;
                // Disk trouble costs the image, not the run.
                if let Err(e) = Self::write(dir, index, image) {
                    tracing::warn!(image = counter, "failed to write image: {}", e);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_writer() {
        let dir = std::env::temp_dir().join(format!("lpdrx-sink-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let mut writer = ImageWriter::create(Some(&dir)).unwrap();
        writer
            .push(ReorderedImage {
                frame_number: 12,
                image_number: 1,
                image_counter: 3,
                width: 2,
                height: 1,
                pixels: vec![0x0102, 0x0304],
            })
            .unwrap();

        let raw = fs::read(dir.join("image_00000003.raw")).unwrap();
        assert_eq!(raw, vec![0x02, 0x01, 0x04, 0x03]);
        let index = fs::read_to_string(dir.join(INDEX_FILE)).unwrap();
        let entry: serde_json::Value = serde_json::from_str(index.trim()).unwrap();
        assert_eq!(entry["frame_num"], 12);
        assert_eq!(entry["img_num"], 1);
        assert_eq!(entry["file"], "image_00000003.raw");
        fs::remove_dir_all(&dir).unwrap();
    }
}
