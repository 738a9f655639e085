//! CPU reference cross-correlation.
//!
//! Defines the arithmetic every kernel is validated against:
//!
//! ```text
//! out[i0, i1] = Σ_{k0=-L0..=R0} Σ_{k1=-L1..=R1} coeff[k0+L0, k1+L1] · in[i0+k0, i1+k1]
//! ```
//!
//! Neighbours outside the frame contribute nothing, so the identity window
//! reproduces its input including the border pixels.

use crate::types::{FrameShape, HaloKernel};

/// Correlate one frame with the halo window.
///
/// # Panics
/// Panics if `input` or `output` is not exactly one frame long.
pub fn correlate_frame(input: &[f32], output: &mut [f32], frame: FrameShape, halo: &HaloKernel) {
    assert_eq!(input.len(), frame.len(), "input is not one frame");
    assert_eq!(output.len(), frame.len(), "output is not one frame");

    let ext = halo.extents();
    let (height, width) = (frame.height as i64, frame.width as i64);

    for i0 in 0..height {
        for i1 in 0..width {
            let mut acc = 0.0f32;
            for k0 in -(ext.l0 as i64)..=ext.r0 as i64 {
                let y = i0 + k0;
                if y < 0 || y >= height {
                    continue;
                }
                for k1 in -(ext.l1 as i64)..=ext.r1 as i64 {
                    let x = i1 + k1;
                    if x < 0 || x >= width {
                        continue;
                    }
                    acc += halo.at(k0, k1) * input[(y * width + x) as usize];
                }
            }
            output[(i0 * width + i1) as usize] = acc;
        }
    }
}

/// Correlate every frame of a contiguous batch.
pub fn correlate_batch(input: &[f32], output: &mut [f32], frame: FrameShape, halo: &HaloKernel) {
    for (src, dst) in input
        .chunks_exact(frame.len())
        .zip(output.chunks_exact_mut(frame.len()))
    {
        correlate_frame(src, dst, frame, halo);
    }
}
