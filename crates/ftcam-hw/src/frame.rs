//! Frame types and YUYV 4:2:2 decoding.

use std::fmt;

/// Number of interleaved channels in a decoded frame ([Y, Cb, Cr]).
pub const CHANNELS: usize = 3;

/// Pixel encoding of a raw capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    /// YUYV 4:2:2 packed (2 bytes/pixel): [Y0, Cb, Y1, Cr] per pixel pair.
    Yuyv,
    /// Any other FourCC reported by the driver. Never decoded.
    Other([u8; 4]),
}

impl PixelEncoding {
    pub fn from_fourcc(repr: [u8; 4]) -> Self {
        if &repr == b"YUYV" {
            Self::Yuyv
        } else {
            Self::Other(repr)
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            Self::Yuyv => *b"YUYV",
            Self::Other(repr) => *repr,
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&repr).trim_end_matches(['\0', ' ']))
    }
}

/// Frame dimensions, fixed for as long as a device stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of chroma samples per chroma channel in a 4:2:2 buffer.
    pub fn half_pixel_count(&self) -> usize {
        self.pixel_count() / 2
    }

    /// Byte length of a raw 4:2:2 buffer.
    pub fn raw_len(&self) -> usize {
        self.pixel_count() * 2
    }

    /// Byte length of a decoded three-channel buffer.
    pub fn decoded_len(&self) -> usize {
        self.pixel_count() * CHANNELS
    }
}

/// A raw frame as dequeued from the driver.
///
/// Capture buffers are recycled by the source; treat the payload as valid
/// for one pipeline pass only.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl RawFrame {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A fully expanded [Y, Cb, Cr] frame, row-major, three bytes per pixel.
///
/// One instance is allocated per open device and overwritten by every
/// decode. Consumers must copy out anything they want to keep.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    data: Vec<u8>,
    geometry: FrameGeometry,
    sequence: u32,
}

impl DecodedFrame {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            data: vec![0; geometry.decoded_len()],
            geometry,
            sequence: 0,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Driver sequence number of the raw frame this was decoded from.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// [Y, Cb, Cr] at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.geometry.width || y >= self.geometry.height {
            return None;
        }
        let offset = (y as usize * self.geometry.width as usize + x as usize) * CHANNELS;
        let px = self.data.get(offset..offset + CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }

    /// Copy a single plane out of the interleaved buffer (0 = Y, 1 = Cb, 2 = Cr).
    pub fn channel(&self, index: usize) -> Option<Vec<u8>> {
        if index >= CHANNELS {
            return None;
        }
        Some(
            self.data
                .chunks_exact(CHANNELS)
                .map(|px| px[index])
                .collect(),
        )
    }

    /// Convert to interleaved RGB using ITU-R BT.601 coefficients.
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(CHANNELS) {
            rgb.extend_from_slice(&ycbcr_to_rgb(px[0], px[1], px[2]));
        }
        rgb
    }

    /// Average luma (0.0–255.0).
    pub fn mean_luma(&self) -> f32 {
        let pixels = self.geometry.pixel_count();
        if pixels == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .data
            .chunks_exact(CHANNELS)
            .map(|px| u64::from(px[0]))
            .sum();
        sum as f32 / pixels as f32
    }
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = f32::from(y);
    let cb = f32::from(cb) - 128.0;
    let cr = f32::from(cr) - 128.0;

    let r = y + 1.402 * cr;
    let g = y - 0.344_14 * cb - 0.714_14 * cr;
    let b = y + 1.772 * cb;

    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// How much of each raw frame the decoder expands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// All three channels.
    #[default]
    Full,
    /// Only channel 0 (luma). For sensors that carry the same image in
    /// every channel; chroma channels keep whatever they held before.
    LumaOnly,
}

/// Converts raw 4:2:2 frames of a fixed geometry into [`DecodedFrame`]s.
#[derive(Debug, Clone, Copy)]
pub struct PixelDecoder {
    geometry: FrameGeometry,
    mode: DecodeMode,
}

impl PixelDecoder {
    pub fn new(geometry: FrameGeometry, mode: DecodeMode) -> Self {
        Self { geometry, mode }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Allocate an output frame matching this decoder's geometry.
    pub fn output_frame(&self) -> DecodedFrame {
        DecodedFrame::new(self.geometry)
    }

    /// Decode `raw` into `out`, reusing the output buffer.
    pub fn decode(&self, raw: &RawFrame, out: &mut DecodedFrame) -> Result<(), FrameError> {
        match raw.encoding {
            PixelEncoding::Yuyv => {}
            PixelEncoding::Other(_) => {
                return Err(FrameError::UnsupportedPixelFormat(raw.encoding));
            }
        }

        if raw.geometry() != self.geometry || out.geometry != self.geometry {
            return Err(FrameError::GeometryMismatch {
                expected: self.geometry,
                actual: raw.geometry(),
            });
        }

        match self.mode {
            DecodeMode::Full => decode_yuyv(&raw.data, &mut out.data, self.geometry)?,
            DecodeMode::LumaOnly => decode_yuyv_luma(&raw.data, &mut out.data, self.geometry)?,
        }
        out.sequence = raw.sequence;
        Ok(())
    }
}

/// Expand packed YUYV into interleaved [Y, Cb, Cr].
///
/// Luma is every even-indexed byte. Cb (offset 1, stride 4) and Cr
/// (offset 3, stride 4) are replicated to both pixels of their pair.
pub fn decode_yuyv(yuyv: &[u8], out: &mut [u8], geometry: FrameGeometry) -> Result<(), FrameError> {
    let src = checked_source(yuyv, out, geometry)?;

    let mut pairs = src.chunks_exact(4);
    let mut dst = out.chunks_exact_mut(CHANNELS * 2);
    for (quad, px) in (&mut pairs).zip(&mut dst) {
        let (y0, cb, y1, cr) = (quad[0], quad[1], quad[2], quad[3]);
        px.copy_from_slice(&[y0, cb, cr, y1, cb, cr]);
    }

    // Odd pixel count: a lone trailing [Y, Cb] with no Cr.
    let tail = pairs.remainder();
    if tail.len() == 2 {
        let last = geometry.pixel_count() - 1;
        out[last * CHANNELS..(last + 1) * CHANNELS].copy_from_slice(&[tail[0], tail[1], 128]);
    }
    Ok(())
}

/// Write only the luma channel of a YUYV buffer into channel 0 of `out`.
pub fn decode_yuyv_luma(
    yuyv: &[u8],
    out: &mut [u8],
    geometry: FrameGeometry,
) -> Result<(), FrameError> {
    let src = checked_source(yuyv, out, geometry)?;
    for (px, &y) in out.chunks_exact_mut(CHANNELS).zip(src.iter().step_by(2)) {
        px[0] = y;
    }
    Ok(())
}

fn checked_source<'a>(
    yuyv: &'a [u8],
    out: &[u8],
    geometry: FrameGeometry,
) -> Result<&'a [u8], FrameError> {
    let expected = geometry.raw_len();
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    if out.len() != geometry.decoded_len() {
        return Err(FrameError::InvalidLength {
            expected: geometry.decoded_len(),
            actual: out.len(),
        });
    }
    Ok(&yuyv[..expected])
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unsupported pixel format: {0} (need YUYV)")]
    UnsupportedPixelFormat(PixelEncoding),
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame geometry mismatch: expected {expected:?}, got {actual:?}")]
    GeometryMismatch {
        expected: FrameGeometry,
        actual: FrameGeometry,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuyv_frame(data: Vec<u8>, width: u32, height: u32) -> RawFrame {
        RawFrame {
            data,
            encoding: PixelEncoding::Yuyv,
            width,
            height,
            sequence: 7,
        }
    }

    #[test]
    fn test_geometry_vga() {
        let g = FrameGeometry::new(640, 480);
        assert_eq!(g.pixel_count(), 307_200);
        assert_eq!(g.half_pixel_count(), 153_600);
        assert_eq!(g.raw_len(), 614_400);
        assert_eq!(g.decoded_len(), 921_600);
    }

    #[test]
    fn test_decode_2x1() {
        // [Y0=100, Cb=20, Y1=200, Cr=30]
        let g = FrameGeometry::new(2, 1);
        let decoder = PixelDecoder::new(g, DecodeMode::Full);
        let mut out = decoder.output_frame();
        decoder
            .decode(&yuyv_frame(vec![100, 20, 200, 30], 2, 1), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[100, 20, 30, 200, 20, 30]);
        assert_eq!(out.sequence(), 7);
    }

    #[test]
    fn test_decode_luma_is_even_bytes() {
        // 4x2 image = 8 pixels, 16 YUYV bytes
        let g = FrameGeometry::new(4, 2);
        let yuyv: Vec<u8> = (0..16).collect();
        let decoder = PixelDecoder::new(g, DecodeMode::Full);
        let mut out = decoder.output_frame();
        decoder.decode(&yuyv_frame(yuyv.clone(), 4, 2), &mut out).unwrap();

        assert_eq!(out.data().len(), g.decoded_len());
        let luma = out.channel(0).unwrap();
        let even: Vec<u8> = yuyv.iter().step_by(2).copied().collect();
        assert_eq!(luma, even);
        // Chroma replicated across each pixel pair.
        assert_eq!(out.channel(1).unwrap(), vec![1, 1, 5, 5, 9, 9, 13, 13]);
        assert_eq!(out.channel(2).unwrap(), vec![3, 3, 7, 7, 11, 11, 15, 15]);
    }

    #[test]
    fn test_decode_vga_lengths() {
        let g = FrameGeometry::new(640, 480);
        let decoder = PixelDecoder::new(g, DecodeMode::Full);
        let mut out = decoder.output_frame();
        let yuyv: Vec<u8> = (0..g.raw_len()).map(|i| (i % 251) as u8).collect();
        decoder.decode(&yuyv_frame(yuyv.clone(), 640, 480), &mut out).unwrap();
        assert_eq!(out.data().len(), 921_600);
        assert_eq!(out.pixel(0, 0), Some([yuyv[0], yuyv[1], yuyv[3]]));
        assert_eq!(out.pixel(1, 0), Some([yuyv[2], yuyv[1], yuyv[3]]));
        assert_eq!(out.pixel(640, 0), None);
    }

    #[test]
    fn test_decode_luma_only_leaves_chroma() {
        let g = FrameGeometry::new(2, 1);
        let decoder = PixelDecoder::new(g, DecodeMode::LumaOnly);
        let mut out = decoder.output_frame();
        decoder
            .decode(&yuyv_frame(vec![100, 20, 200, 30], 2, 1), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[100, 0, 0, 200, 0, 0]);
    }

    #[test]
    fn test_decode_unsupported_encoding() {
        let g = FrameGeometry::new(2, 1);
        let decoder = PixelDecoder::new(g, DecodeMode::Full);
        let mut out = decoder.output_frame();
        let mut raw = yuyv_frame(vec![0; 4], 2, 1);
        raw.encoding = PixelEncoding::from_fourcc(*b"MJPG");
        let err = decoder.decode(&raw, &mut out).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedPixelFormat(_)));
        assert_eq!(err.to_string(), "unsupported pixel format: MJPG (need YUYV)");
    }

    #[test]
    fn test_decode_short_buffer() {
        let g = FrameGeometry::new(2, 1);
        let decoder = PixelDecoder::new(g, DecodeMode::Full);
        let mut out = decoder.output_frame();
        let result = decoder.decode(&yuyv_frame(vec![100, 128], 2, 1), &mut out);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_decode_long_buffer_uses_prefix() {
        let g = FrameGeometry::new(2, 1);
        let mut out = vec![0u8; g.decoded_len()];
        decode_yuyv(&[1, 2, 3, 4, 9, 9], &mut out, g).unwrap();
        assert_eq!(out, vec![1, 2, 4, 3, 2, 4]);
    }

    #[test]
    fn test_decode_geometry_mismatch() {
        let decoder = PixelDecoder::new(FrameGeometry::new(4, 2), DecodeMode::Full);
        let mut out = decoder.output_frame();
        let result = decoder.decode(&yuyv_frame(vec![0; 4], 2, 1), &mut out);
        assert!(matches!(result, Err(FrameError::GeometryMismatch { .. })));
    }

    #[test]
    fn test_decode_odd_pixel_count() {
        let g = FrameGeometry::new(3, 1);
        let mut out = vec![0u8; g.decoded_len()];
        decode_yuyv(&[10, 20, 30, 40, 50, 60], &mut out, g).unwrap();
        assert_eq!(out, vec![10, 20, 40, 30, 20, 40, 50, 60, 128]);
    }

    #[test]
    fn test_to_rgb_neutral_chroma_is_gray() {
        let g = FrameGeometry::new(2, 1);
        let mut frame = DecodedFrame::new(g);
        frame.data_mut().copy_from_slice(&[90, 128, 128, 200, 128, 128]);
        assert_eq!(frame.to_rgb(), vec![90, 90, 90, 200, 200, 200]);
        assert!((frame.mean_luma() - 145.0).abs() < 1e-3);
    }

    #[test]
    fn test_channel_out_of_range() {
        let frame = DecodedFrame::new(FrameGeometry::new(2, 2));
        assert!(frame.channel(3).is_none());
    }

    #[test]
    fn test_encoding_display() {
        assert_eq!(PixelEncoding::Yuyv.to_string(), "YUYV");
        assert_eq!(PixelEncoding::from_fourcc(*b"Y16 ").to_string(), "Y16");
    }
}
