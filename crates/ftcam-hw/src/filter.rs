//! Per-frame post-filters applied to decoded frames before delivery.

use crate::frame::{DecodedFrame, CHANNELS};

/// A transform applied to every decoded frame before it reaches the consumer.
///
/// Implementations work in place and must not keep references to the frame.
pub trait FramePostProcessor: Send {
    fn process(&mut self, frame: &mut DecodedFrame);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Square median filter over each channel independently, replicating
/// edge pixels at the border.
#[derive(Debug, Clone)]
pub struct MedianBlur {
    radius: usize,
    /// Copy of the input frame; the filter reads from here and writes into the frame.
    scratch: Vec<u8>,
}

impl MedianBlur {
    /// `ksize` must be odd; even sizes are rounded up.
    pub fn new(ksize: usize) -> Self {
        Self {
            radius: ksize.max(1) / 2,
            scratch: Vec::new(),
        }
    }

    pub fn ksize(&self) -> usize {
        self.radius * 2 + 1
    }
}

impl Default for MedianBlur {
    fn default() -> Self {
        Self::new(5)
    }
}

impl FramePostProcessor for MedianBlur {
    fn process(&mut self, frame: &mut DecodedFrame) {
        let w = frame.width() as usize;
        let h = frame.height() as usize;
        if w == 0 || h == 0 || self.radius == 0 {
            return;
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(frame.data());
        let src = &self.scratch;
        let dst = frame.data_mut();

        let r = self.radius as isize;
        let ksize = self.radius * 2 + 1;
        let mut window = vec![0u8; ksize * ksize];
        let mid = window.len() / 2;

        for y in 0..h {
            for x in 0..w {
                for c in 0..CHANNELS {
                    let mut n = 0;
                    for dy in -r..=r {
                        let sy = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                        for dx in -r..=r {
                            let sx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                            window[n] = src[(sy * w + sx) * CHANNELS + c];
                            n += 1;
                        }
                    }
                    let (_, median, _) = window.select_nth_unstable(mid);
                    dst[(y * w + x) * CHANNELS + c] = *median;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "median-blur"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameGeometry;

    fn frame_from_luma(width: u32, height: u32, luma: &[u8]) -> DecodedFrame {
        let mut frame = DecodedFrame::new(FrameGeometry::new(width, height));
        for (px, &y) in frame.data_mut().chunks_exact_mut(CHANNELS).zip(luma) {
            px.copy_from_slice(&[y, 128, 128]);
        }
        frame
    }

    #[test]
    fn test_median_removes_impulse_noise() {
        let mut luma = vec![50u8; 49];
        luma[24] = 255; // centre of a 7x7 frame
        let mut frame = frame_from_luma(7, 7, &luma);

        MedianBlur::default().process(&mut frame);

        assert!(frame.channel(0).unwrap().iter().all(|&y| y == 50));
        assert!(frame.channel(1).unwrap().iter().all(|&c| c == 128));
    }

    #[test]
    fn test_median_preserves_flat_frame() {
        let mut frame = frame_from_luma(4, 3, &[77; 12]);
        let before = frame.data().to_vec();
        MedianBlur::default().process(&mut frame);
        assert_eq!(frame.data(), &before[..]);
    }

    #[test]
    fn test_median_preserves_step_edge() {
        // Left half dark, right half bright: a median keeps the edge sharp.
        let luma: Vec<u8> = (0..64).map(|i| if i % 8 < 4 { 10 } else { 200 }).collect();
        let mut frame = frame_from_luma(8, 8, &luma);
        MedianBlur::default().process(&mut frame);
        assert_eq!(frame.channel(0).unwrap(), luma);
    }

    #[test]
    fn test_median_ksize() {
        assert_eq!(MedianBlur::default().ksize(), 5);
        assert_eq!(MedianBlur::new(4).ksize(), 5);
        assert_eq!(MedianBlur::new(3).ksize(), 3);
    }

    #[test]
    fn test_median_single_pixel_frame() {
        let mut frame = frame_from_luma(1, 1, &[42]);
        MedianBlur::default().process(&mut frame);
        assert_eq!(frame.pixel(0, 0), Some([42, 128, 128]));
    }
}
