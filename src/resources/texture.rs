//! Image loading for light masks and projector pictures

use crate::backend::traits::*;
use crate::backend::types::*;
use image::{DynamicImage, GenericImageView};
use std::path::Path;

/// Decoded RGBA8 pixels
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let img = image::open(path)
            .map_err(|e| BackendError::ImageLoadFailed(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_image(img, &name))
    }

    pub fn from_bytes(bytes: &[u8], name: &str) -> BackendResult<Self> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| BackendError::ImageLoadFailed(format!("{}: {}", name, e)))?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        // rows are stored bottom-up like every other image
        let rgba = image::imageops::flip_vertical(&img.to_rgba8());
        Self {
            width,
            height,
            data: rgba.into_raw(),
            name: name.to_string(),
        }
    }

    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a backend image and upload the pixels
    pub fn upload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<ImageHandle> {
        let image = backend.create_image(&ImageDescriptor {
            label: Some(self.name.clone()),
            width: self.width,
            height: self.height,
            format: TextureFormat::Rgba8,
            samples: 1,
        })?;
        backend.write_image(image, &self.data);
        log::info!(
            "Uploaded image '{}' ({}x{})",
            self.name,
            self.width,
            self.height
        );
        Ok(image)
    }
}

/// Decode a picture from disk into an Rgba8 image
pub fn load_image<P: AsRef<Path>>(
    backend: &mut dyn GraphicsBackend,
    path: P,
) -> BackendResult<ImageHandle> {
    TextureData::from_file(path)?.upload(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use glam::Vec4;

    #[test]
    fn test_solid_color_upload() {
        let mut backend = HeadlessBackend::default();
        let image = TextureData::white().upload(&mut backend).unwrap();
        assert_eq!(backend.read_image(image).unwrap(), &[Vec4::ONE]);
    }

    #[test]
    fn test_missing_file_is_error() {
        let mut backend = HeadlessBackend::default();
        assert!(matches!(
            load_image(&mut backend, "does/not/exist.png"),
            Err(BackendError::ImageLoadFailed(_))
        ));
    }

    #[test]
    fn test_decode_png_bytes() {
        let mut png = Vec::new();
        let pixels = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
        DynamicImage::ImageRgba8(pixels)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        let data = TextureData::from_bytes(&png, "red").unwrap();
        assert_eq!((data.width, data.height), (2, 2));
        assert_eq!(&data.data[0..4], &[255, 0, 0, 255]);
    }
}
