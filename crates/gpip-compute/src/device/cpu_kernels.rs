//! Native implementations of the kernel entry points.
//!
//! Neighborhood kernels emulate the device execution model: the image is
//! split into work-groups of `local` pixels, each group loads a halo-padded
//! tile into its scratch buffer (clamp-to-edge at the image border) and
//! computes its pixels from that tile only. Output goes back into the image
//! buffer; reads come from a snapshot taken at launch.

use rayon::prelude::*;

/// Positional argument type expected by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ArgKind {
    Buffer,
    Local,
    U32,
    F32,
}

impl ArgKind {
    pub(super) fn name(&self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Local => "local",
            Self::U32 => "u32",
            Self::F32 => "f32",
        }
    }
}

use ArgKind::{Buffer, F32, Local, U32};

/// Entry points the CPU device can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NativeKernel {
    Erode,
    Dilate,
    MinFilter,
    MaxFilter,
    Median,
    Convolve,
    Gradient,
    Lut,
    Rgb2Hsv,
}

impl NativeKernel {
    pub(super) fn from_entry(entry: &str) -> Option<Self> {
        Some(match entry {
            "erode" => Self::Erode,
            "dilate" => Self::Dilate,
            "min_filter" => Self::MinFilter,
            "max_filter" => Self::MaxFilter,
            "median" => Self::Median,
            "convolve" => Self::Convolve,
            "gradient" => Self::Gradient,
            "lut" => Self::Lut,
            "rgb2hsv" => Self::Rgb2Hsv,
            _ => return None,
        })
    }

    /// Positional signature: image, auxiliary buffers, scratch, width,
    /// height, channels, then kernel scalars (halo first).
    pub(super) fn signature(&self) -> &'static [ArgKind] {
        match self {
            Self::Erode | Self::Dilate | Self::MinFilter | Self::MaxFilter | Self::Median => {
                &[Buffer, Local, U32, U32, U32, U32]
            }
            Self::Convolve => &[Buffer, Buffer, Local, U32, U32, U32, U32, F32],
            Self::Gradient => &[Buffer, Buffer, Buffer, Local, U32, U32, U32, U32, U32],
            Self::Lut => &[Buffer, Buffer, U32, U32, U32],
            Self::Rgb2Hsv => &[Buffer, U32, U32, U32],
        }
    }

    /// Number of auxiliary buffers after the image.
    pub(super) fn aux_buffers(&self) -> usize {
        self.signature()[1..].iter().take_while(|k| **k == Buffer).count()
    }

    /// Whether the kernel reads a neighborhood through local scratch.
    pub(super) fn uses_scratch(&self) -> bool {
        self.signature().contains(&Local)
    }
}

/// Launch-time geometry of one kernel invocation.
#[derive(Debug, Clone, Copy)]
pub(super) struct Geometry {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub local: [usize; 2],
}

impl Geometry {
    pub(super) fn byte_len(&self) -> usize {
        self.width * self.height * self.channels
    }
}

/// Halo-padded work-group tile.
struct Tile<'a> {
    data: &'a [u8],
    width: usize,
    channels: usize,
}

impl Tile<'_> {
    #[inline]
    fn at(&self, tx: usize, ty: usize, ch: usize) -> u8 {
        self.data[(ty * self.width + tx) * self.channels + ch]
    }
}

/// Runs `op` for every pixel, one work-group at a time.
///
/// `op(tile, cx, cy, out, window)` receives the tile coordinates of the
/// pixel center and writes all channels of the output pixel.
fn run_tiled<F>(img: &mut [u8], geo: &Geometry, halo: usize, op: F)
where
    F: Fn(&Tile<'_>, usize, usize, &mut [u8], &mut Vec<u8>) + Sync,
{
    let Geometry { width, height, channels, local: [lx, ly] } = *geo;
    let len = geo.byte_len();
    let src = img[..len].to_vec();
    let tile_w = lx + 2 * halo;
    let tile_h = ly + 2 * halo;
    let groups_x = width.div_ceil(lx);
    let band = ly * width * channels;

    img[..len].par_chunks_mut(band).enumerate().for_each(|(gy, band_out)| {
        let mut scratch = vec![0u8; tile_w * tile_h * channels];
        let mut window = Vec::new();
        let mut pixel = vec![0u8; channels];
        let y0 = gy * ly;

        for gx in 0..groups_x {
            let x0 = gx * lx;

            for ty in 0..tile_h {
                let sy = clamp_coord(y0 as i64 + ty as i64 - halo as i64, height);
                for tx in 0..tile_w {
                    let sx = clamp_coord(x0 as i64 + tx as i64 - halo as i64, width);
                    let s = (sy * width + sx) * channels;
                    let d = (ty * tile_w + tx) * channels;
                    scratch[d..d + channels].copy_from_slice(&src[s..s + channels]);
                }
            }

            let tile = Tile { data: &scratch, width: tile_w, channels };
            for iy in 0..ly {
                if y0 + iy >= height {
                    break;
                }
                for ix in 0..lx {
                    let x = x0 + ix;
                    if x >= width {
                        break;
                    }
                    op(&tile, ix + halo, iy + halo, &mut pixel, &mut window);
                    let o = (iy * width + x) * channels;
                    band_out[o..o + channels].copy_from_slice(&pixel);
                }
            }
        }
    });
}

#[inline]
fn clamp_coord(v: i64, dim: usize) -> usize {
    v.clamp(0, dim as i64 - 1) as usize
}

#[inline]
fn round_to_u8(v: f32) -> u8 {
    (v + 0.5).floor().clamp(0.0, 255.0) as u8
}

/// Per-channel min or max over the `(2*halo+1)^2` window.
pub(super) fn reduce(img: &mut [u8], geo: &Geometry, halo: usize, take_max: bool) {
    run_tiled(img, geo, halo, |tile, cx, cy, out, _| {
        for (ch, o) in out.iter_mut().enumerate() {
            let mut acc = if take_max { u8::MIN } else { u8::MAX };
            for ty in cy - halo..=cy + halo {
                for tx in cx - halo..=cx + halo {
                    let v = tile.at(tx, ty, ch);
                    acc = if take_max { acc.max(v) } else { acc.min(v) };
                }
            }
            *o = acc;
        }
    });
}

/// Per-channel median of the window.
pub(super) fn median(img: &mut [u8], geo: &Geometry, halo: usize) {
    run_tiled(img, geo, halo, |tile, cx, cy, out, window| {
        for (ch, o) in out.iter_mut().enumerate() {
            window.clear();
            for ty in cy - halo..=cy + halo {
                for tx in cx - halo..=cx + halo {
                    window.push(tile.at(tx, ty, ch));
                }
            }
            window.sort_unstable();
            *o = window[window.len() / 2];
        }
    });
}

/// Per-channel weighted sum with a row-major `(2*halo+1)^2` mask, scaled by
/// `scale` and rounded.
pub(super) fn convolve(img: &mut [u8], geo: &Geometry, halo: usize, mask: &[f32], scale: f32) {
    let side = 2 * halo + 1;
    run_tiled(img, geo, halo, |tile, cx, cy, out, _| {
        for (ch, o) in out.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for my in 0..side {
                for mx in 0..side {
                    let v = tile.at(cx + mx - halo, cy + my - halo, ch) as f32;
                    sum += mask[my * side + mx] * v;
                }
            }
            *o = round_to_u8(sum * scale);
        }
    });
}

/// Luma weights of the color channels feeding the gradient magnitude.
fn gradient_weights(color_channels: usize) -> &'static [f32] {
    if color_channels >= 3 { &[0.30, 0.55, 0.15] } else { &[1.0] }
}

/// Channels carrying color; the last channel of 2- and 4-channel images is
/// alpha.
pub(super) fn color_channels(channels: usize) -> usize {
    match channels {
        2 | 4 => channels - 1,
        c => c,
    }
}

/// Gradient magnitude from two masks, written to every color channel.
///
/// `sqrt(sum_c w_c * (gx_c^2 + gy_c^2))`, clamped to 255 and zeroed below
/// `threshold`. Alpha passes through.
pub(super) fn gradient(
    img: &mut [u8],
    geo: &Geometry,
    halo: usize,
    mask_x: &[f32],
    mask_y: &[f32],
    threshold: u32,
) {
    let side = 2 * halo + 1;
    let colors = color_channels(geo.channels);
    let weights = gradient_weights(colors);
    run_tiled(img, geo, halo, |tile, cx, cy, out, _| {
        let mut acc = 0.0f32;
        for (ch, w) in weights.iter().enumerate() {
            let (mut gx, mut gy) = (0.0f32, 0.0f32);
            for my in 0..side {
                for mx in 0..side {
                    let v = tile.at(cx + mx - halo, cy + my - halo, ch) as f32;
                    gx += mask_x[my * side + mx] * v;
                    gy += mask_y[my * side + mx] * v;
                }
            }
            acc += w * (gx * gx + gy * gy);
        }
        let g = acc.sqrt().min(255.0);
        let value = if g < threshold as f32 { 0 } else { g as u8 };
        out[..colors].fill(value);
        for ch in colors..out.len() {
            out[ch] = tile.at(cx, cy, ch);
        }
    });
}

/// Per-byte remap through a 256-entry table.
pub(super) fn lut(img: &mut [u8], geo: &Geometry, table: &[u8; 256]) {
    img[..geo.byte_len()]
        .par_chunks_mut(geo.width * geo.channels)
        .for_each(|row| {
            for v in row.iter_mut() {
                *v = table[*v as usize];
            }
        });
}

/// RGB to HSV, all components scaled to `0..=255`. Extra channels pass
/// through.
pub(super) fn rgb2hsv(img: &mut [u8], geo: &Geometry) {
    img[..geo.byte_len()].par_chunks_mut(geo.channels).for_each(|px| {
        let [h, s, v] = hsv(px[0], px[1], px[2]);
        px[0] = h;
        px[1] = s;
        px[2] = v;
    });
}

pub(super) fn hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let mut h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    if h < 0.0 {
        h += 360.0;
    }

    [round_to_u8(h * 255.0 / 360.0), round_to_u8(s), max as u8]
}
