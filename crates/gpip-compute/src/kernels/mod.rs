//! Kernel sources.
//!
//! Every program is built from [`COMMON`] followed by one filter source.
//! The binding layout follows the positional argument convention:
//!
//! | binding | contents |
//! |---|---|
//! | 0 | image buffer, packed `u8`, written with `atomicOr` |
//! | 1 | snapshot of the image taken at launch (read-only) |
//! | 2.. | auxiliary buffers in argument order |
//! | last | scalar arguments as `u32` words: width, height, channels, then kernel scalars |
//!
//! Neighborhood kernels stage a halo-padded tile in work-group memory and
//! read out-of-image pixels clamped to the nearest edge.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{DeviceError, DeviceResult};

/// Support module: image bindings, byte access and tile loading.
pub const COMMON: &str = r#"
@group(0) @binding(0) var<storage, read_write> img: array<atomic<u32>>;
@group(0) @binding(1) var<storage, read> src: array<u32>;

override WG_X: u32 = 16u;
override WG_Y: u32 = 16u;

const TILE_CAP: u32 = 4096u;

var<workgroup> tile: array<u32, TILE_CAP>;

fn load_byte(i: u32) -> u32 {
    return (src[i >> 2u] >> ((i & 3u) * 8u)) & 0xffu;
}

// The image is cleared before launch; each byte is written exactly once.
fn store_byte(i: u32, v: u32) {
    atomicOr(&img[i >> 2u], min(v, 255u) << ((i & 3u) * 8u));
}

fn clamp_coord(v: i32, dim: u32) -> u32 {
    return u32(clamp(v, 0, i32(dim) - 1));
}

fn round_u8(v: f32) -> u32 {
    return u32(clamp(floor(v + 0.5), 0.0, 255.0));
}

// Stage the (WG_X + 2*halo) x (WG_Y + 2*halo) tile. Call from uniform control flow.
fn load_tile(group: vec3<u32>, local_index: u32, width: u32, height: u32, channels: u32, halo: u32) {
    let tw = WG_X + 2u * halo;
    let th = WG_Y + 2u * halo;
    let count = min(tw * th * channels, TILE_CAP);
    let stride = WG_X * WG_Y;
    let passes = (count + stride - 1u) / stride;
    let x0 = i32(group.x * WG_X) - i32(halo);
    let y0 = i32(group.y * WG_Y) - i32(halo);

    for (var k = 0u; k < passes; k++) {
        let i = k * stride + local_index;
        if i < count {
            let c = i % channels;
            let p = i / channels;
            let sx = clamp_coord(x0 + i32(p % tw), width);
            let sy = clamp_coord(y0 + i32(p / tw), height);
            tile[i] = load_byte((sy * width + sx) * channels + c);
        }
    }
    workgroupBarrier();
}

fn tile_at(tx: u32, ty: u32, c: u32, halo: u32, channels: u32) -> u32 {
    let tw = WG_X + 2u * halo;
    return tile[(ty * tw + tx) * channels + c];
}
"#;

/// Erode, dilate and the standalone min/max order statistics.
pub const MORPHOLOGY: &str = r#"
@group(0) @binding(2) var<storage, read> params: array<u32>;  // w, h, c, halo

fn window_reduce(gid: vec3<u32>, lid: vec3<u32>, group: vec3<u32>, lidx: u32, take_max: bool) {
    let width = params[0];
    let height = params[1];
    let channels = params[2];
    let halo = params[3];
    load_tile(group, lidx, width, height, channels, halo);
    if gid.x >= width || gid.y >= height { return; }

    let base = (gid.y * width + gid.x) * channels;
    for (var c = 0u; c < channels; c++) {
        var acc = select(255u, 0u, take_max);
        for (var dy = 0u; dy <= 2u * halo; dy++) {
            for (var dx = 0u; dx <= 2u * halo; dx++) {
                let v = tile_at(lid.x + dx, lid.y + dy, c, halo, channels);
                acc = select(min(acc, v), max(acc, v), take_max);
            }
        }
        store_byte(base + c, acc);
    }
}

@compute @workgroup_size(WG_X, WG_Y, 1)
fn erode(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
         @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    window_reduce(gid, lid, group, lidx, false);
}

@compute @workgroup_size(WG_X, WG_Y, 1)
fn dilate(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
          @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    window_reduce(gid, lid, group, lidx, true);
}

@compute @workgroup_size(WG_X, WG_Y, 1)
fn min_filter(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
              @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    window_reduce(gid, lid, group, lidx, false);
}

@compute @workgroup_size(WG_X, WG_Y, 1)
fn max_filter(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
              @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    window_reduce(gid, lid, group, lidx, true);
}
"#;

/// Per-channel median, windows up to 9x9.
pub const MEDIAN: &str = r#"
@group(0) @binding(2) var<storage, read> params: array<u32>;  // w, h, c, halo

@compute @workgroup_size(WG_X, WG_Y, 1)
fn median(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
          @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    let width = params[0];
    let height = params[1];
    let channels = params[2];
    let halo = min(params[3], 4u);
    load_tile(group, lidx, width, height, channels, halo);
    if gid.x >= width || gid.y >= height { return; }

    let base = (gid.y * width + gid.x) * channels;
    var win: array<u32, 81>;
    for (var c = 0u; c < channels; c++) {
        var n = 0u;
        for (var dy = 0u; dy <= 2u * halo; dy++) {
            for (var dx = 0u; dx <= 2u * halo; dx++) {
                win[n] = tile_at(lid.x + dx, lid.y + dy, c, halo, channels);
                n++;
            }
        }
        // insertion sort
        for (var i = 1u; i < n; i++) {
            let key = win[i];
            var j = i;
            loop {
                if j == 0u || win[j - 1u] <= key { break; }
                win[j] = win[j - 1u];
                j--;
            }
            win[j] = key;
        }
        store_byte(base + c, win[n / 2u]);
    }
}
"#;

/// Mask convolution: `round(sum(mask * window) * scale)` per channel.
pub const CONVOLVE: &str = r#"
@group(0) @binding(2) var<storage, read> mask: array<f32>;
@group(0) @binding(3) var<storage, read> params: array<u32>;  // w, h, c, halo, scale (f32 bits)

@compute @workgroup_size(WG_X, WG_Y, 1)
fn convolve(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
            @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    let width = params[0];
    let height = params[1];
    let channels = params[2];
    let halo = params[3];
    let scale = bitcast<f32>(params[4]);
    load_tile(group, lidx, width, height, channels, halo);
    if gid.x >= width || gid.y >= height { return; }

    let side = 2u * halo + 1u;
    let base = (gid.y * width + gid.x) * channels;
    for (var c = 0u; c < channels; c++) {
        var sum = 0.0;
        for (var my = 0u; my < side; my++) {
            for (var mx = 0u; mx < side; mx++) {
                sum += mask[my * side + mx] * f32(tile_at(lid.x + mx, lid.y + my, c, halo, channels));
            }
        }
        store_byte(base + c, round_u8(sum * scale));
    }
}
"#;

/// Two-mask gradient magnitude over the color channels.
pub const GRADIENT: &str = r#"
@group(0) @binding(2) var<storage, read> mask_x: array<f32>;
@group(0) @binding(3) var<storage, read> mask_y: array<f32>;
@group(0) @binding(4) var<storage, read> params: array<u32>;  // w, h, c, halo, threshold

@compute @workgroup_size(WG_X, WG_Y, 1)
fn gradient(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(local_invocation_id) lid: vec3<u32>,
            @builtin(workgroup_id) group: vec3<u32>, @builtin(local_invocation_index) lidx: u32) {
    let width = params[0];
    let height = params[1];
    let channels = params[2];
    let halo = params[3];
    let threshold = params[4];
    load_tile(group, lidx, width, height, channels, halo);
    if gid.x >= width || gid.y >= height { return; }

    // last channel of 2- and 4-channel images is alpha
    let colors = select(channels, channels - 1u, channels == 2u || channels == 4u);
    var weights = array<f32, 3>(1.0, 0.0, 0.0);
    if colors >= 3u {
        weights = array<f32, 3>(0.30, 0.55, 0.15);
    }

    let side = 2u * halo + 1u;
    var acc = 0.0;
    for (var c = 0u; c < min(colors, 3u); c++) {
        var gx = 0.0;
        var gy = 0.0;
        for (var my = 0u; my < side; my++) {
            for (var mx = 0u; mx < side; mx++) {
                let v = f32(tile_at(lid.x + mx, lid.y + my, c, halo, channels));
                gx += mask_x[my * side + mx] * v;
                gy += mask_y[my * side + mx] * v;
            }
        }
        acc += weights[c] * (gx * gx + gy * gy);
    }
    let g = min(sqrt(acc), 255.0);
    let value = select(u32(g), 0u, g < f32(threshold));

    let base = (gid.y * width + gid.x) * channels;
    for (var c = 0u; c < channels; c++) {
        if c < colors {
            store_byte(base + c, value);
        } else {
            store_byte(base + c, tile_at(lid.x + halo, lid.y + halo, c, halo, channels));
        }
    }
}
"#;

/// 256-entry lookup table applied to every channel.
pub const LUT: &str = r#"
@group(0) @binding(2) var<storage, read> table: array<u32>;
@group(0) @binding(3) var<storage, read> params: array<u32>;  // w, h, c

@compute @workgroup_size(WG_X, WG_Y, 1)
fn lut(@builtin(global_invocation_id) gid: vec3<u32>) {
    let width = params[0];
    let height = params[1];
    let channels = params[2];
    if gid.x >= width || gid.y >= height { return; }

    let base = (gid.y * width + gid.x) * channels;
    for (var c = 0u; c < channels; c++) {
        store_byte(base + c, table[load_byte(base + c)]);
    }
}
"#;

/// RGB to HSV, components scaled to 0..255.
pub const COLOR: &str = r#"
@group(0) @binding(2) var<storage, read> params: array<u32>;  // w, h, c

@compute @workgroup_size(WG_X, WG_Y, 1)
fn rgb2hsv(@builtin(global_invocation_id) gid: vec3<u32>) {
    let width = params[0];
    let height = params[1];
    let channels = params[2];
    if gid.x >= width || gid.y >= height { return; }

    let base = (gid.y * width + gid.x) * channels;
    let r = f32(load_byte(base));
    let g = f32(load_byte(base + 1u));
    let b = f32(load_byte(base + 2u));
    let mx = max(max(r, g), b);
    let mn = min(min(r, g), b);
    let delta = mx - mn;

    var s = 0.0;
    if mx > 0.0 {
        s = delta / mx * 255.0;
    }
    var h = 0.0;
    if delta == 0.0 {
        h = 0.0;
    } else if mx == r {
        h = 60.0 * ((g - b) / delta);
    } else if mx == g {
        h = 60.0 * ((b - r) / delta + 2.0);
    } else {
        h = 60.0 * ((r - g) / delta + 4.0);
    }
    if h < 0.0 {
        h += 360.0;
    }

    store_byte(base, round_u8(h * 255.0 / 360.0));
    store_byte(base + 1u, round_u8(s));
    store_byte(base + 2u, u32(mx));
    for (var c = 3u; c < channels; c++) {
        store_byte(base + c, load_byte(base + c));
    }
}
"#;

/// Where a filter's kernel source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    /// One of the sources compiled into the crate, by name.
    Embedded(&'static str),
    /// A source file on disk, concatenated after [`COMMON`] like the embedded ones.
    Path(PathBuf),
}

impl KernelSource {
    /// Embedded source names.
    pub const EMBEDDED: [&'static str; 6] = ["morphology", "median", "convolve", "gradient", "lut", "color"];

    /// Source file on disk.
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    /// Full program text (support module + filter source) for `entry`.
    ///
    /// A missing embedded name or unreadable file is a build failure.
    pub fn load(&self, entry: &str) -> DeviceResult<String> {
        let body = match self {
            Self::Embedded(name) => embedded(name)
                .ok_or_else(|| DeviceError::BuildFailure {
                    entry: entry.to_string(),
                    log: format!("no embedded kernel source named `{name}`"),
                })?
                .to_string(),
            Self::Path(path) => std::fs::read_to_string(path).map_err(|e| DeviceError::BuildFailure {
                entry: entry.to_string(),
                log: format!("cannot read kernel source {}: {e}", path.display()),
            })?,
        };
        debug!(source = %self, entry, bytes = body.len(), "loaded kernel source");
        Ok(format!("{COMMON}\n{body}"))
    }
}

impl std::fmt::Display for KernelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded(name) => write!(f, "embedded:{name}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

fn embedded(name: &str) -> Option<&'static str> {
    Some(match name {
        "morphology" => MORPHOLOGY,
        "median" => MEDIAN,
        "convolve" => CONVOLVE,
        "gradient" => GRADIENT,
        "lut" => LUT,
        "color" => COLOR,
        _ => return None,
    })
}
