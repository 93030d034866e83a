pub(crate) const ZSTD_COMPRESSION_LVL: i32 = 3;

// Length fields read from a stream are untrusted; upfront allocations made
// from them are capped at this many bytes.
pub(crate) const PREALLOC_LIMIT: usize = 1 << 20;

#[inline]
pub(crate) fn quantize_coord(value: f64, origin: f64, scale: f64) -> i32 {
    ((value - origin) * scale).round() as i32
}

#[inline]
pub(crate) fn dequantize_coord(symbol: i32, origin: f64, scale: f64) -> f64 {
    origin + symbol as f64 / scale
}

// Step 1 leaves values untouched, so qp 0 is the lossless setting.
#[inline]
pub(crate) fn attribute_step(init_qp: u8) -> u16 {
    1 + init_qp as u16 / 8
}

#[inline]
pub(crate) fn quantize_u8(value: u8, step: u16) -> u8 {
    ((value as u16 + step / 2) / step).min(255) as u8
}

#[inline]
pub(crate) fn dequantize_u8(symbol: u8, step: u16) -> u8 {
    (symbol as u16 * step).min(255) as u8
}
