#![forbid(unsafe_code)]

//! Image transfer helpers for the private channel (97/25).
//!
//! Outbound images are downscaled to fit the service's 600x600 bound,
//! re-encoded as JPEG and base64'd. Inbound payloads are decoded and
//! format-sniffed but left to the consumer to render.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use thiserror::Error;

/// Largest width or height the service accepts for private images.
pub const MAX_IMAGE_DIMENSION: u32 = 600;

#[derive(Debug, Error)]
pub enum ImageError {
	#[error("image encode failed: {0}")]
	Encode(#[from] image::ImageError),
	#[error("image payload is not valid base64: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error("image payload has an unrecognized format")]
	UnknownFormat,
}

/// A wire-ready outbound image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundImage {
	pub width: u32,
	pub height: u32,
	pub data_base64: String,
}

/// A received image, raw bytes plus the sniffed container format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundImage {
	pub bytes: Vec<u8>,
	pub format: ImageFormat,
}

/// Prepare an image for the wire: downscale to the 600x600 bound when
/// needed (aspect preserved), re-encode as JPEG, base64.
pub fn prepare_outbound(img: &DynamicImage) -> Result<OutboundImage, ImageError> {
	let scaled;
	let img = if img.width() > MAX_IMAGE_DIMENSION || img.height() > MAX_IMAGE_DIMENSION {
		scaled = img.resize(MAX_IMAGE_DIMENSION, MAX_IMAGE_DIMENSION, FilterType::Lanczos3);
		&scaled
	} else {
		img
	};

	// JPEG has no alpha channel.
	let rgb = img.to_rgb8();
	let mut buf = Cursor::new(Vec::new());
	rgb.write_to(&mut buf, ImageFormat::Jpeg)?;

	Ok(OutboundImage {
		width: img.width(),
		height: img.height(),
		data_base64: BASE64.encode(buf.into_inner()),
	})
}

/// Decode a received 97/25 payload into raw bytes plus format.
pub fn decode_inbound(data_base64: &str) -> Result<InboundImage, ImageError> {
	let bytes = BASE64.decode(data_base64)?;
	let format = image::guess_format(&bytes).map_err(|_| ImageError::UnknownFormat)?;
	Ok(InboundImage { bytes, format })
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::RgbImage;

	fn solid(width: u32, height: u32) -> DynamicImage {
		DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 120, 240])))
	}

	#[test]
	fn small_images_keep_their_dimensions() {
		let out = prepare_outbound(&solid(320, 200)).unwrap();
		assert_eq!((out.width, out.height), (320, 200));
		assert!(!out.data_base64.is_empty());
	}

	#[test]
	fn oversized_images_are_bounded_with_aspect_preserved() {
		let out = prepare_outbound(&solid(1200, 300)).unwrap();
		assert_eq!(out.width, 600);
		assert_eq!(out.height, 150);

		let out = prepare_outbound(&solid(300, 1200)).unwrap();
		assert_eq!(out.width, 150);
		assert_eq!(out.height, 600);
	}

	#[test]
	fn outbound_payload_is_valid_base64_jpeg() {
		let out = prepare_outbound(&solid(64, 64)).unwrap();
		let decoded = decode_inbound(&out.data_base64).unwrap();
		assert_eq!(decoded.format, ImageFormat::Jpeg);
	}

	#[test]
	fn inbound_rejects_garbage() {
		assert!(matches!(decode_inbound("!!not base64!!"), Err(ImageError::Base64(_))));
		// Valid base64 of bytes that are not any image container.
		let junk = BASE64.encode([0u8, 1, 2, 3]);
		assert!(matches!(decode_inbound(&junk), Err(ImageError::UnknownFormat)));
	}

	#[test]
	fn inbound_sniffs_png() {
		let mut buf = std::io::Cursor::new(Vec::new());
		solid(8, 8).write_to(&mut buf, ImageFormat::Png).unwrap();
		let decoded = decode_inbound(&BASE64.encode(buf.into_inner())).unwrap();
		assert_eq!(decoded.format, ImageFormat::Png);
	}
}
