//! Extended-format (VP8X) header and alpha-plane (ALPH) decoding.

use byteorder::ReadBytesExt;
use std::io::Read;

use crate::decoder::DecodingError;
use crate::lossless::LosslessDecoder;

/// Feature flags and canvas size from a VP8X chunk.
#[derive(Debug, Clone, Default)]
pub(crate) struct WebPExtendedInfo {
    pub(crate) icc_profile: bool,
    pub(crate) alpha: bool,
    pub(crate) exif_metadata: bool,
    pub(crate) xmp_metadata: bool,
    pub(crate) animation: bool,
    pub(crate) canvas_width: u32,
    pub(crate) canvas_height: u32,
}

pub(crate) fn read_3_bytes<R: Read>(r: &mut R) -> Result<u32, DecodingError> {
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf)?;
    Ok(u32::from(buf[0]) | u32::from(buf[1]) << 8 | u32::from(buf[2]) << 16)
}

/// Parses the 10-byte VP8X payload.
///
/// Flags live in the first byte; the three bytes after it are reserved and
/// must be zero. The canvas is stored minus one, 24-bit little-endian.
pub(crate) fn read_extended_header<R: Read>(
    r: &mut R,
) -> Result<WebPExtendedInfo, DecodingError> {
    let flags = r.read_u8()?;

    let icc_profile = flags & 0b0010_0000 != 0;
    let alpha = flags & 0b0001_0000 != 0;
    let exif_metadata = flags & 0b0000_1000 != 0;
    let xmp_metadata = flags & 0b0000_0100 != 0;
    let animation = flags & 0b0000_0010 != 0;
    let tiles = flags & 0b0000_0001 != 0;
    if tiles {
        // Tiling was never standardized; the bit carries no data chunk.
        log::debug!("ignoring tiles bit in VP8X flags");
    }

    let mut reserved = [0u8; 3];
    r.read_exact(&mut reserved)?;
    if reserved != [0, 0, 0] {
        return Err(DecodingError::InfoBitsInvalid {
            name: "reserved",
            value: u32::from(reserved[0]) << 16
                | u32::from(reserved[1]) << 8
                | u32::from(reserved[2]),
        });
    }

    let canvas_width = read_3_bytes(r)? + 1;
    let canvas_height = read_3_bytes(r)? + 1;
    if canvas_width > 16384 || canvas_height > 16384 {
        return Err(DecodingError::ImageTooLarge);
    }

    log::debug!("vp8x canvas {canvas_width}x{canvas_height}, alpha={alpha}, anim={animation}");

    Ok(WebPExtendedInfo {
        icc_profile,
        alpha,
        exif_metadata,
        xmp_metadata,
        animation,
        canvas_width,
        canvas_height,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilteringMethod {
    None,
    Horizontal,
    Vertical,
    Gradient,
}

/// A fully reconstructed alpha plane: `width * height` bytes, unfiltered
/// and level-expanded.
pub(crate) struct AlphaChunk {
    pub(crate) data: Vec<u8>,
}

/// Decodes an ALPH chunk payload into a plane of `width * height` alpha
/// values.
pub(crate) fn read_alpha_chunk<R: Read>(
    r: &mut R,
    width: u16,
    height: u16,
) -> Result<AlphaChunk, DecodingError> {
    let header = r.read_u8()?;

    let reserved = header >> 4;
    if reserved != 0 {
        return Err(DecodingError::InfoBitsInvalid {
            name: "reserved",
            value: reserved.into(),
        });
    }

    let preprocessing = (header >> 3) & 1 == 1;
    let filtering_method = match (header >> 1) & 3 {
        0 => FilteringMethod::None,
        1 => FilteringMethod::Horizontal,
        2 => FilteringMethod::Vertical,
        3 => FilteringMethod::Gradient,
        _ => unreachable!("2-bit value"),
    };
    let lossless_compression = header & 1 == 1;

    let mut data = if lossless_compression {
        // The plane is stored as the green channel of a headless VP8L
        // image with the frame's dimensions.
        let mut decoder = LosslessDecoder::new(r);
        let frame = decoder.decode_frame_implicit_dimensions(width, height)?;
        let mut plane = vec![0u8; usize::from(width) * usize::from(height)];
        frame.fill_green(&mut plane);
        plane
    } else {
        let mut plane = Vec::new();
        r.read_to_end(&mut plane)?;
        if plane.len() != usize::from(width) * usize::from(height) {
            return Err(DecodingError::AlphaChunkSizeMismatch);
        }
        plane
    };

    unfilter_plane(&mut data, width.into(), height.into(), filtering_method);

    if preprocessing {
        // Inverse of the lossy level-reduction preprocessing.
        for value in &mut data {
            *value = (*value & 0x0f) * 17;
        }
    }

    Ok(AlphaChunk { data })
}

/// Undoes the alpha prediction filter in place. Neighbors outside the
/// plane read as zero; all arithmetic is modulo 256.
fn unfilter_plane(data: &mut [u8], width: usize, height: usize, method: FilteringMethod) {
    match method {
        FilteringMethod::None => {}
        FilteringMethod::Horizontal => {
            for y in 0..height {
                for x in 1..width {
                    data[y * width + x] =
                        data[y * width + x].wrapping_add(data[y * width + x - 1]);
                }
            }
        }
        FilteringMethod::Vertical => {
            for y in 1..height {
                for x in 0..width {
                    data[y * width + x] =
                        data[y * width + x].wrapping_add(data[(y - 1) * width + x]);
                }
            }
        }
        FilteringMethod::Gradient => {
            for y in 0..height {
                for x in 0..width {
                    let left = if x > 0 {
                        i32::from(data[y * width + x - 1])
                    } else {
                        0
                    };
                    let top = if y > 0 {
                        i32::from(data[(y - 1) * width + x])
                    } else {
                        0
                    };
                    let top_left = if x > 0 && y > 0 {
                        i32::from(data[(y - 1) * width + x - 1])
                    } else {
                        0
                    };
                    let predictor = (left + top - top_left).rem_euclid(256) as u8;
                    data[y * width + x] = data[y * width + x].wrapping_add(predictor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    fn filter_horizontal(data: &[u8], width: usize, height: usize) -> Vec<u8> {
        let mut out = data.to_vec();
        for y in 0..height {
            for x in (1..width).rev() {
                out[y * width + x] =
                    data[y * width + x].wrapping_sub(data[y * width + x - 1]);
            }
        }
        out
    }

    fn filter_vertical(data: &[u8], width: usize, height: usize) -> Vec<u8> {
        let mut out = data.to_vec();
        for y in (1..height).rev() {
            for x in 0..width {
                out[y * width + x] =
                    data[y * width + x].wrapping_sub(data[(y - 1) * width + x]);
            }
        }
        out
    }

    macro_rules! unfilter_round_trip_test {
        ($($name:ident: $filter:ident / $method:ident),* $(,)?) => {$(
            paste! {
                #[test]
                fn [<$name _round_trip>]() {
                    let plane: Vec<u8> =
                        (0u32..12).map(|i| (i * 37 % 256) as u8).collect();
                    let mut filtered = $filter(&plane, 4, 3);
                    unfilter_plane(&mut filtered, 4, 3, FilteringMethod::$method);
                    assert_eq!(filtered, plane);
                }
            }
        )*};
    }

    unfilter_round_trip_test! {
        horizontal: filter_horizontal / Horizontal,
        vertical: filter_vertical / Vertical,
    }

    #[test]
    fn gradient_unfilter_uses_zero_outside_the_plane() {
        // Residuals chosen so the first row and column accumulate.
        let mut data = vec![10, 1, 2, 3, 4, 0, 0, 0, 0];
        unfilter_plane(&mut data, 3, 3, FilteringMethod::Gradient);
        // Row 0: pure horizontal accumulation; column 0: vertical.
        assert_eq!(&data[0..3], &[10, 11, 13]);
        assert_eq!(data[3], 13);
        assert_eq!(data[6], 13);
    }

    #[test]
    fn raw_alpha_plane_passes_through() {
        let payload = [0x00u8, 0, 255, 128, 64];
        let chunk =
            read_alpha_chunk(&mut std::io::Cursor::new(&payload[..]), 2, 2).unwrap();
        assert_eq!(chunk.data, vec![0, 255, 128, 64]);
    }

    #[test]
    fn raw_alpha_size_mismatch_is_rejected() {
        let payload = [0x00u8, 1, 2, 3];
        assert!(matches!(
            read_alpha_chunk(&mut std::io::Cursor::new(&payload[..]), 2, 2),
            Err(DecodingError::AlphaChunkSizeMismatch)
        ));
    }

    #[test]
    fn alpha_reserved_bits_are_rejected() {
        let payload = [0x80u8, 0, 0, 0, 0];
        assert!(matches!(
            read_alpha_chunk(&mut std::io::Cursor::new(&payload[..]), 2, 2),
            Err(DecodingError::InfoBitsInvalid { name: "reserved", .. })
        ));
    }

    #[test]
    fn level_reduction_expands_low_nibble() {
        let payload = [0b0000_1000u8, 0x0f, 0x04, 0xff, 0x00];
        let chunk =
            read_alpha_chunk(&mut std::io::Cursor::new(&payload[..]), 2, 2).unwrap();
        assert_eq!(chunk.data, vec![255, 68, 255, 0]);
    }

    #[test]
    fn vp8x_reserved_bytes_must_be_zero() {
        let payload = [0x00u8, 0x01, 0, 0, 1, 0, 0, 1, 0, 0];
        assert!(matches!(
            read_extended_header(&mut std::io::Cursor::new(&payload[..])),
            Err(DecodingError::InfoBitsInvalid { name: "reserved", .. })
        ));
    }

    #[test]
    fn vp8x_header_parses_flags_and_canvas() {
        let payload = [0x30u8, 0, 0, 0, 1, 0, 0, 3, 0, 0];
        let info =
            read_extended_header(&mut std::io::Cursor::new(&payload[..])).unwrap();
        assert!(info.icc_profile && info.alpha);
        assert!(!info.exif_metadata && !info.xmp_metadata && !info.animation);
        assert_eq!((info.canvas_width, info.canvas_height), (2, 4));
    }
}
