//! Conversion of decoded images into the interleaved format drawn on surfaces.

use crate::frame::{ImageBuffer, PixelFormat};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaInfo {
	None,
	First,
	Last,
	PremultipliedFirst,
	PremultipliedLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
	Default,
	Little32,
	Big32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingIntent {
	Default,
	AbsoluteColorimetric,
	RelativeColorimetric,
	Perceptual,
	Saturation,
}

/// Describes the memory layout of an interleaved pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormatSpec {
	pub bits_per_component: u8,
	pub bits_per_pixel: u8,
	pub alpha: AlphaInfo,
	pub byte_order: ByteOrder,
	pub rendering_intent: RenderingIntent,
}

impl PixelFormatSpec {
	pub const fn bytes_per_pixel(&self) -> usize {
		self.bits_per_pixel as usize / 8
	}
}

/// The format every draw strategy produces: A, R, G, B bytes in memory order.
pub const ARGB8888: PixelFormatSpec = PixelFormatSpec {
	bits_per_component: 8,
	bits_per_pixel: 32,
	alpha: AlphaInfo::First,
	byte_order: ByteOrder::Default,
	rendering_intent: RenderingIntent::Default,
};

/// A converted image in [ARGB8888], reused between frames.
#[derive(Debug, Clone, Default)]
pub struct ArgbImage {
	width: u32,
	height: u32,
	data: Vec<u8>,
}

impl ArgbImage {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn width(&self) -> u32 {
		self.width
	}

	pub fn height(&self) -> u32 {
		self.height
	}

	pub fn stride(&self) -> usize {
		self.width as usize * ARGB8888.bytes_per_pixel()
	}

	pub fn format(&self) -> &'static PixelFormatSpec {
		&ARGB8888
	}

	pub fn data(&self) -> &[u8] {
		&self.data
	}

	pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
		if x >= self.width || y >= self.height {
			return None;
		}

		let offset = y as usize * self.stride() + x as usize * 4;
		self.data.get(offset..offset + 4)?.try_into().ok()
	}

	fn reset(&mut self, width: u32, height: u32) {
		self.width = width;
		self.height = height;
		self.data.resize(self.stride() * height as usize, 0);
	}
}

/// Converts decoded images to [ARGB8888].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
	/// Vectorized conversion through the `yuv` crate.
	Accelerated,

	/// One pixel at a time, straight from the formula.
	Cpu,
}

impl Converter {
	pub fn convert(&self, image: &ImageBuffer, target: &mut ArgbImage) -> Result<()> {
		validate(image)?;
		target.reset(image.width, image.height);

		match (self, image.format) {
			(Self::Accelerated, PixelFormat::Nv12) => nv12_accelerated(image, target)?,
			(Self::Cpu, PixelFormat::Nv12) => nv12_pixels(image, target),
			(Self::Accelerated, PixelFormat::Bgra) => bgra_words(image, target),
			(Self::Cpu, PixelFormat::Bgra) => bgra_pixels(image, target),
		}

		Ok(())
	}
}

fn validate(image: &ImageBuffer) -> Result<()> {
	let width = image.width as usize;
	let height = image.height as usize;

	if width == 0 || height == 0 {
		return Err(Error::InvalidImage);
	}

	let valid = match image.format {
		PixelFormat::Nv12 => match image.planes.as_slice() {
			[luma, chroma] => {
				luma.stride >= width
					&& chroma.stride >= width.next_multiple_of(2)
					&& luma.data.len() >= luma.stride * height
					&& chroma.data.len() >= chroma.stride * height.div_ceil(2)
			}
			_ => false,
		},
		PixelFormat::Bgra => match image.planes.as_slice() {
			[plane] => plane.stride >= width * 4 && plane.data.len() >= plane.stride * height,
			_ => false,
		},
	};

	match valid {
		true => Ok(()),
		false => Err(Error::InvalidImage),
	}
}

// BT.601 video range, in 8.8 fixed point.
fn clip(value: i32) -> u8 {
	(value >> 8).clamp(0, 255) as u8
}

fn yuv_to_argb(y: u8, u: u8, v: u8) -> [u8; 4] {
	let c = y as i32 - 16;
	let d = u as i32 - 128;
	let e = v as i32 - 128;

	[
		0xff,
		clip(298 * c + 409 * e + 128),
		clip(298 * c - 100 * d - 208 * e + 128),
		clip(298 * c + 516 * d + 128),
	]
}

fn nv12_pixels(image: &ImageBuffer, target: &mut ArgbImage) {
	let (luma, chroma) = (&image.planes[0], &image.planes[1]);
	let stride = target.stride();

	for y in 0..image.height as usize {
		for x in 0..image.width as usize {
			let uv = (y / 2) * chroma.stride + (x / 2) * 2;
			let argb = yuv_to_argb(luma.data[y * luma.stride + x], chroma.data[uv], chroma.data[uv + 1]);

			let offset = y * stride + x * 4;
			target.data[offset..offset + 4].copy_from_slice(&argb);
		}
	}
}

fn bgra_pixels(image: &ImageBuffer, target: &mut ArgbImage) {
	let plane = &image.planes[0];
	let stride = target.stride();

	for y in 0..image.height as usize {
		for x in 0..image.width as usize {
			let src = y * plane.stride + x * 4;
			let dst = y * stride + x * 4;

			target.data[dst] = plane.data[src + 3];
			target.data[dst + 1] = plane.data[src + 2];
			target.data[dst + 2] = plane.data[src + 1];
			target.data[dst + 3] = plane.data[src];
		}
	}
}

// Byte swapping a row at a time, four bytes per word.
fn bgra_words(image: &ImageBuffer, target: &mut ArgbImage) {
	let plane = &image.planes[0];
	let width = image.width as usize * 4;
	let stride = target.stride();

	for (src, dst) in plane.data.chunks(plane.stride).zip(target.data.chunks_exact_mut(stride)) {
		for (src, dst) in src[..width].chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
			let word = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
			dst.copy_from_slice(&word.to_be_bytes());
		}
	}
}

fn nv12_accelerated(image: &ImageBuffer, target: &mut ArgbImage) -> Result<()> {
	let (luma, chroma) = (&image.planes[0], &image.planes[1]);
	let stride = |value: usize| u32::try_from(value).map_err(|_| Error::InvalidImage);

	let planes = yuv::YuvBiPlanarImage {
		y_plane: &luma.data[..],
		y_stride: stride(luma.stride)?,
		uv_plane: &chroma.data[..],
		uv_stride: stride(chroma.stride)?,
		width: image.width,
		height: image.height,
	};

	let rgba_stride = stride(target.stride())?;
	yuv::yuv_nv12_to_rgba(
		&planes,
		&mut target.data,
		rgba_stride,
		yuv::YuvRange::Limited,
		yuv::YuvStandardMatrix::Bt601,
		yuv::YuvConversionMode::Balanced,
	)
	.map_err(|err| {
		tracing::debug!(?err, width = image.width, height = image.height, "failed to convert image");
		Error::InvalidImage
	})?;

	// RGBA to ARGB.
	for pixel in target.data.chunks_exact_mut(4) {
		pixel.rotate_right(1);
	}

	Ok(())
}
