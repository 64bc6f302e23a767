use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use tar::Archive;

use crate::filter::{Filter, MinResolution};
use crate::pool::FilterFactory;
use crate::sample::{ImageFormat, ImagePayload, Sample, SampleMeta};

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::new(width, height);
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

pub fn image_text_sample(sample_id: &str, width: u32, height: u32) -> Sample {
    Sample::ImageText {
        meta: SampleMeta::new("ds", sample_id),
        image: ImagePayload {
            bytes: png_bytes(width, height),
            format: ImageFormat::Png,
        },
        text: format!("caption {sample_id}"),
    }
}

pub fn text_sample(sample_id: &str) -> Sample {
    Sample::Text {
        meta: SampleMeta::new("ds", sample_id),
        text: format!("text {sample_id}"),
    }
}

pub struct MinResFactory {
    pub min_width: u32,
    pub min_height: u32,
}

impl FilterFactory for MinResFactory {
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String> {
        Ok(vec![Box::new(MinResolution::new(self.min_width, self.min_height))])
    }
}

pub struct PassAllFactory;

impl FilterFactory for PassAllFactory {
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String> {
        Ok(Vec::new())
    }
}

pub fn entry_names(shard_path: &Path) -> Vec<String> {
    let file = File::open(shard_path).unwrap();
    let mut archive = Archive::new(file);
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
