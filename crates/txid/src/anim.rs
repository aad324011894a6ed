//! Animation key derivation
//!
//! A frame row holds two colors, a rotation target and four cubic-bezier
//! control points. The key is the state of that animation at a time
//! fraction picked by the verification key, rendered as hex.

use crate::error::{Error, Result};

/// Colors (6) + rotation (1) + curve control points (4).
const MIN_ROW_LEN: usize = 11;

/// Rotation range the rotation target is scaled into.
const ROTATION_MIN: f64 = 60.0;
const ROTATION_MAX: f64 = 360.0;

const BISECT_EPSILON: f64 = 1e-5;
const BISECT_MAX_STEPS: usize = 64;

/// Cubic bezier easing with endpoints fixed at (0,0) and (1,1).
#[derive(Debug, Clone, Copy)]
pub struct Cubic {
    curves: [f64; 4],
}

impl Cubic {
    pub fn new(curves: [f64; 4]) -> Self {
        Self { curves }
    }

    /// Eased progress at `time`, extrapolated linearly outside `[0, 1]`.
    pub fn value_at(&self, time: f64) -> f64 {
        let [x1, y1, x2, y2] = self.curves;

        if time <= 0.0 {
            let gradient = if x1 > 0.0 {
                y1 / x1
            } else if y1 == 0.0 && x2 > 0.0 {
                y2 / x2
            } else {
                0.0
            };
            return gradient * time;
        }

        if time >= 1.0 {
            let gradient = if x2 < 1.0 {
                (y2 - 1.0) / (x2 - 1.0)
            } else if x2 == 1.0 && x1 < 1.0 {
                (y1 - 1.0) / (x1 - 1.0)
            } else {
                0.0
            };
            return 1.0 + gradient * (time - 1.0);
        }

        let (mut start, mut end, mut mid) = (0.0, 1.0, 0.0);
        for _ in 0..BISECT_MAX_STEPS {
            if start >= end {
                break;
            }
            mid = (start + end) / 2.0;
            let x = bezier(x1, x2, mid);
            if (time - x).abs() < BISECT_EPSILON {
                break;
            }
            if x < time {
                start = mid;
            } else {
                end = mid;
            }
        }
        bezier(y1, y2, mid)
    }
}

fn bezier(a: f64, b: f64, m: f64) -> f64 {
    3.0 * a * (1.0 - m) * (1.0 - m) * m + 3.0 * b * (1.0 - m) * m * m + m * m * m
}

/// Scale a 0..=255 frame value into `[min, max]`.
fn scale(value: f64, min: f64, max: f64) -> f64 {
    value * (max - min) / 255.0 + min
}

fn round_dp(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn lerp(from: f64, to: f64, f: f64) -> f64 {
    from * (1.0 - f) + to * f
}

/// Hex rendering of a non-negative float: upper-case integer digits,
/// then `.` and fractional hex digits if there is a fraction. Zero renders
/// as the empty string.
pub fn float_to_hex(mut x: f64) -> String {
    let digit = |d: u32| char::from_digit(d, 16).unwrap_or('0').to_ascii_uppercase();

    let mut int_part = Vec::new();
    let mut quotient = x.trunc() as u64;
    let mut fraction = x - quotient as f64;
    while quotient > 0 {
        quotient = (x / 16.0).trunc() as u64;
        let remainder = (x - quotient as f64 * 16.0).trunc() as u32;
        int_part.push(digit(remainder));
        x = quotient as f64;
    }
    let mut out: String = int_part.into_iter().rev().collect();

    if fraction == 0.0 {
        return out;
    }
    out.push('.');
    while fraction > 0.0 {
        fraction *= 16.0;
        let d = fraction.trunc();
        fraction -= d;
        out.push(digit(d as u32));
    }
    out
}

/// Render the animation state of `row` at `target_time`.
pub fn animation_key(row: &[f64], target_time: f64) -> Result<String> {
    if row.len() < MIN_ROW_LEN {
        return Err(Error::Animation(format!(
            "frame row has {} values, need {MIN_ROW_LEN}",
            row.len()
        )));
    }

    let rotation_target = scale(row[6], ROTATION_MIN, ROTATION_MAX).floor();
    let mut curves = [0.0; 4];
    for (i, value) in row[7..MIN_ROW_LEN].iter().enumerate() {
        let min = if i % 2 == 1 { -1.0 } else { 0.0 };
        curves[i] = round_dp(scale(*value, min, 1.0), 2);
    }
    let progress = Cubic::new(curves).value_at(target_time);

    let mut parts: Vec<String> = (0..3)
        .map(|i| {
            let channel = lerp(row[i], row[i + 3], progress).max(0.0);
            format!("{:x}", channel.round_ties_even() as u64)
        })
        .collect();

    let rad = lerp(0.0, rotation_target, progress).to_radians();
    for value in [rad.cos(), -rad.sin(), rad.sin(), rad.cos()] {
        let hex = float_to_hex(round_dp(value, 2).abs());
        parts.push(if hex.starts_with('.') {
            format!("0{hex}").to_lowercase()
        } else if hex.is_empty() {
            "0".to_string()
        } else {
            hex
        });
    }
    parts.push("0".into());
    parts.push("0".into());

    Ok(parts.concat().replace(['.', '-'], ""))
}

/// Pick the frame row and time fraction from the key and render the key.
///
/// `indices[0]` selects the row (`key[i] % 16`); the product of
/// `key[i] % 16` over the remaining indices, rounded half-up to a multiple
/// of 10 and divided by `total_time`, is the time fraction.
pub fn derive_animation_key(
    rows: &[Vec<f64>],
    indices: &[usize],
    key: &[u8],
    total_time: u32,
) -> Result<String> {
    let key_at = |i: usize| {
        key.get(i).map(|b| u64::from(*b % 16)).ok_or_else(|| {
            Error::Animation(format!("index {i} outside {}-byte key", key.len()))
        })
    };

    let (first, rest) = indices
        .split_first()
        .ok_or_else(|| Error::Script("no animation indices in script".into()))?;

    let row_index = key_at(*first)? as usize;
    let row = rows
        .get(row_index)
        .ok_or_else(|| Error::Animation(format!("row {row_index} of {} missing", rows.len())))?;

    let mut frame_time: u64 = 1;
    for i in rest {
        frame_time = frame_time.checked_mul(key_at(*i)?).ok_or_else(|| {
            Error::Animation(format!("frame time overflows over {} indices", rest.len()))
        })?;
    }
    let frame_time = ((frame_time as f64 / 10.0 + 0.5).floor() * 10.0) as u64;
    let target_time = frame_time as f64 / f64::from(total_time);

    animation_key(row, target_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW: [f64; 11] = [255.0, 0.0, 16.0, 0.0, 255.0, 0.0, 0.0, 0.0, 0.0, 255.0, 255.0];

    #[test]
    fn float_hex_rendering() {
        assert_eq!(float_to_hex(0.0), "");
        assert_eq!(float_to_hex(1.0), "1");
        assert_eq!(float_to_hex(255.0), "FF");
        assert_eq!(float_to_hex(0.5), ".8");
        assert_eq!(float_to_hex(1.25), "1.4");
    }

    #[test]
    fn linear_curve_is_identity() {
        // Control points on the diagonal give y == x
        let cubic = Cubic::new([0.0, 0.0, 1.0, 1.0]);
        for t in [0.1, 0.25, 0.5, 0.9] {
            assert!((cubic.value_at(t) - t).abs() < 1e-3, "t={t}");
        }
    }

    #[test]
    fn curve_extrapolates_outside_unit_interval() {
        let cubic = Cubic::new([0.5, 0.25, 0.5, 0.75]);
        assert_eq!(cubic.value_at(0.0), 0.0);
        assert!((cubic.value_at(-1.0) + 0.5).abs() < 1e-9);
        assert!((cubic.value_at(1.0) - 1.0).abs() < 1e-9);
        assert!((cubic.value_at(2.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn key_at_start_of_animation() {
        // t=0: start color, zero rotation -> identity matrix
        assert_eq!(animation_key(&ROW, 0.0).unwrap(), "ff010100100");
    }

    #[test]
    fn key_at_end_of_animation() {
        // t=1: end color; rotation target floor(0*300/255+60) = 60 degrees
        let key = animation_key(&ROW, 1.0).unwrap();
        assert!(key.starts_with("0ff0"), "got {key}");
        assert!(key.ends_with("00"));
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()), "got {key}");
    }

    #[test]
    fn short_row_is_rejected() {
        assert!(matches!(
            animation_key(&ROW[..8], 0.5),
            Err(Error::Animation(_))
        ));
    }

    #[test]
    fn derive_selects_row_and_time() {
        let mut key = vec![0u8; 16];
        key[2] = 17; // row 1
        key[7] = 16; // frame time factor 0
        key[9] = 5;
        let rows = vec![vec![1.0; 11], ROW.to_vec()];

        let derived = derive_animation_key(&rows, &[2, 7, 9], &key, 4096).unwrap();
        assert_eq!(derived, animation_key(&ROW, 0.0).unwrap());
    }

    #[test]
    fn derive_rejects_out_of_range_index() {
        let rows = vec![ROW.to_vec()];
        let err = derive_animation_key(&rows, &[0, 40], &[0; 8], 4096).unwrap_err();
        assert!(matches!(err, Error::Animation(_)));

        let err = derive_animation_key(&rows, &[], &[0; 8], 4096).unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn derive_rejects_overflowing_frame_time() {
        let rows = vec![vec![1.0; 11]];
        let mut key = vec![15u8; 2];
        key[0] = 0;
        let mut indices = vec![0];
        indices.extend([1; 18]);

        let err = derive_animation_key(&rows, &indices, &key, 4096).unwrap_err();
        assert!(matches!(err, Error::Animation(_)), "got {err:?}");

        // 15^16 still fits
        indices.truncate(17);
        assert!(derive_animation_key(&rows, &indices, &key, 4096).is_ok());
    }
}
