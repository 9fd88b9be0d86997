//! Annex-B access-unit extraction.
//!
//! One call finds one coded unit:
//!
//! 1. The first `00 00 01` start code in the window marks `start`.
//! 2. Start codes are classified by their NAL header; the first codable
//!    (VCL) one latches "unit started".
//! 3. The next start code after that, whatever its type, is `end`.
//!
//! Parameter sets and delimiters in front of a picture therefore travel
//! with it.  If the window runs out before step 3 the call reports
//! [`Extraction::NeedMoreData`] and the caller refills.

use hwpipe_core::types::CodecKind;

use crate::window::ByteWindow;

/// Byte offsets of one unit inside a [`ByteWindow`].
///
/// Valid until the window is next refilled; copy the bytes out first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessUnit {
    pub start: usize,
    pub end: usize,
    /// Carries picture data (a VCL NAL latched the unit).
    pub is_codable: bool,
    /// The latching NAL is an IDR (H.264) or IRAP (HEVC) picture.
    pub is_keyframe: bool,
}

impl AccessUnit {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn bytes<'a>(&self, window: &'a ByteWindow) -> &'a [u8] {
        &window.as_slice()[self.start..self.end]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extraction {
    Unit(AccessUnit),
    NeedMoreData,
}

/// Running byte accounting across extraction calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanProgress {
    /// Sum of `end - start` over every extracted unit.
    pub consumed: u64,
    /// Bytes passed over outside any unit (leading junk, dropped units).
    pub skipped: u64,
    /// Bytes read from the input so far.
    pub total_read: u64,
}

impl ScanProgress {
    /// Every byte read has been accounted for.
    pub fn is_drained(&self) -> bool {
        self.consumed + self.skipped >= self.total_read
    }
}

/// NAL header facts needed by the scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NalClass {
    codable: bool,
    keyframe: bool,
}

/// Classify the NAL whose start code begins at `i`.
///
/// `None` when the header bytes are not in `data` yet.
fn classify(codec: CodecKind, data: &[u8], i: usize) -> Option<NalClass> {
    let header = *data.get(i + 3)?;
    match codec {
        CodecKind::H264 => {
            let nal_type = header & 0x1F;
            Some(NalClass {
                codable: (1..=5).contains(&nal_type),
                keyframe: nal_type == 5,
            })
        }
        CodecKind::Hevc => {
            let nal_type = (header & 0x7E) >> 1;
            let irap = (16..=21).contains(&nal_type);
            if !(irap || nal_type <= 9) {
                return Some(NalClass {
                    codable: false,
                    keyframe: false,
                });
            }
            // first_slice_segment_in_pic_flag follows the 2-byte header.
            let first_slice = *data.get(i + 5)? >> 7 == 1;
            Some(NalClass {
                codable: first_slice,
                keyframe: first_slice && irap,
            })
        }
    }
}

/// Scan `data[from..]` for one unit.
///
/// With `at_eof`, the end of `data` closes a started unit and a truncated
/// header classifies as non-codable.
pub(crate) fn scan(data: &[u8], from: usize, codec: CodecKind, at_eof: bool) -> Extraction {
    let limit = data.len().saturating_sub(2);
    let mut start = None;
    let mut latched: Option<NalClass> = None;
    let mut i = from;

    while i < limit {
        if data[i] != 0 || data[i + 1] != 0 || data[i + 2] != 1 {
            i += 1;
            continue;
        }
        let first = *start.get_or_insert(i);
        if let Some(class) = latched {
            return Extraction::Unit(AccessUnit {
                start: first,
                end: i,
                is_codable: class.codable,
                is_keyframe: class.keyframe,
            });
        }
        let class = match classify(codec, data, i) {
            Some(class) => class,
            None if at_eof => NalClass {
                codable: false,
                keyframe: false,
            },
            None => return Extraction::NeedMoreData,
        };
        if class.codable {
            latched = Some(class);
        }
        i += 3;
    }

    match (at_eof, start) {
        (true, Some(first)) if data.len() > first => {
            let class = latched.unwrap_or(NalClass {
                codable: false,
                keyframe: false,
            });
            Extraction::Unit(AccessUnit {
                start: first,
                end: data.len(),
                is_codable: class.codable,
                is_keyframe: class.keyframe,
            })
        }
        _ => Extraction::NeedMoreData,
    }
}

/// Extract the next access unit from the window's pending bytes.
///
/// On success `progress.consumed` grows by the unit length and any bytes
/// between the read cursor and the unit's first start code are counted as
/// skipped.  The window itself is not modified; the caller advances it
/// to `unit.end` after copying the bytes.
///
/// Once `progress.is_drained()` the caller has seen every byte it read and
/// must refill before asking again; this returns `NeedMoreData` without
/// scanning in that state.
pub fn extract(window: &ByteWindow, progress: &mut ScanProgress, codec: CodecKind) -> Extraction {
    if progress.is_drained() {
        return Extraction::NeedMoreData;
    }
    let outcome = scan(window.as_slice(), window.read_cursor(), codec, false);
    if let Extraction::Unit(unit) = outcome {
        progress.skipped += (unit.start - window.read_cursor()) as u64;
        progress.consumed += unit.len() as u64;
    }
    outcome
}

/// Offset of the first start code at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(bytes: &[u8]) -> (ByteWindow, ScanProgress) {
        let mut w = ByteWindow::new(bytes.len().max(16));
        w.extend_from_slice(bytes);
        let progress = ScanProgress {
            total_read: bytes.len() as u64,
            ..ScanProgress::default()
        };
        (w, progress)
    }

    #[test]
    fn two_markers_yield_one_codable_unit() {
        let bytes = [0, 0, 1, 0x65, 0xAA, 0xBB, 0, 0, 1, 0x41, 0xCC];
        let (w, mut p) = window_with(&bytes);

        let Extraction::Unit(unit) = extract(&w, &mut p, CodecKind::H264) else {
            panic!("expected a unit");
        };
        assert_eq!((unit.start, unit.end), (0, 6));
        assert!(unit.is_codable);
        assert!(unit.is_keyframe);
        assert_eq!(unit.bytes(&w), &bytes[..6]);
        assert_eq!(p.consumed, 6);
    }

    #[test]
    fn parameter_sets_ride_along_with_the_picture() {
        // SPS, PPS, IDR slice, then the next picture.
        let bytes = [
            0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 1, 0x65, 4, 5, 0, 0, 1, 0x41, 6,
        ];
        let (w, mut p) = window_with(&bytes);
        let Extraction::Unit(unit) = extract(&w, &mut p, CodecKind::H264) else {
            panic!("expected a unit");
        };
        assert_eq!((unit.start, unit.end), (0, 17));
    }

    #[test]
    fn single_marker_needs_more_data() {
        let bytes = [0, 0, 1, 0x65, 1, 2, 3, 4, 5, 6];
        let (w, mut p) = window_with(&bytes);
        assert_eq!(extract(&w, &mut p, CodecKind::H264), Extraction::NeedMoreData);
        assert_eq!(p.consumed, 0);
    }

    #[test]
    fn non_codable_markers_never_start_a_unit() {
        // SEI then AUD: neither is VCL, so no unit ends.
        let bytes = [0, 0, 1, 0x06, 1, 0, 0, 1, 0x09, 2, 0, 0, 1, 0x06, 3];
        let (w, mut p) = window_with(&bytes);
        assert_eq!(extract(&w, &mut p, CodecKind::H264), Extraction::NeedMoreData);
    }

    #[test]
    fn hevc_requires_first_slice_flag() {
        // IDR_W_RADL (19) with first_slice_segment flag clear, then set.
        let bytes = [
            0, 0, 1, 0x26, 0x01, 0x00, 9, 0, 0, 1, 0x26, 0x01, 0x80, 9, 0, 0, 1, 0x02, 0x01, 0x80,
        ];
        let (w, mut p) = window_with(&bytes);
        let Extraction::Unit(unit) = extract(&w, &mut p, CodecKind::Hevc) else {
            panic!("expected a unit");
        };
        assert_eq!((unit.start, unit.end), (0, 14));
        assert!(unit.is_keyframe);
    }

    #[test]
    fn hevc_parameter_sets_are_not_codable() {
        // VPS (32), SPS (33), PPS (34) only.
        let bytes = [0, 0, 1, 0x40, 0x01, 0x80, 0, 0, 1, 0x42, 0x01, 0x80, 0, 0, 1, 0x44, 0x01];
        let (w, mut p) = window_with(&bytes);
        assert_eq!(extract(&w, &mut p, CodecKind::Hevc), Extraction::NeedMoreData);
    }

    #[test]
    fn missing_hevc_lookahead_waits_for_input() {
        let bytes = [0, 0, 1, 0x26, 0x01];
        let (w, mut p) = window_with(&bytes);
        assert_eq!(extract(&w, &mut p, CodecKind::Hevc), Extraction::NeedMoreData);
    }

    #[test]
    fn leading_junk_is_counted_as_skipped() {
        let bytes = [9, 9, 9, 0, 0, 1, 0x41, 1, 0, 0, 1, 0x41, 2];
        let (w, mut p) = window_with(&bytes);
        let Extraction::Unit(unit) = extract(&w, &mut p, CodecKind::H264) else {
            panic!("expected a unit");
        };
        assert_eq!(unit.start, 3);
        assert_eq!(p.skipped, 3);
        assert_eq!(p.consumed, 5);
    }

    #[test]
    fn drained_progress_stops_extraction() {
        let bytes = [0, 0, 1, 0x65, 1, 0, 0, 1, 0x41];
        let (w, mut p) = window_with(&bytes);
        p.consumed = p.total_read;
        assert_eq!(extract(&w, &mut p, CodecKind::H264), Extraction::NeedMoreData);
    }

    #[test]
    fn eof_scan_closes_started_unit_at_end_of_data() {
        let bytes = [0, 0, 1, 0x41, 1, 2, 3];
        assert_eq!(
            scan(&bytes, 0, CodecKind::H264, true),
            Extraction::Unit(AccessUnit {
                start: 0,
                end: 7,
                is_codable: true,
                is_keyframe: false,
            })
        );
    }

    /// xorshift64; deterministic noise for the accounting check below.
    fn next_rand(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn random_streams_never_over_account() {
        for seed in 1..=64u64 {
            let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
            let mut bytes = Vec::with_capacity(4096);
            while bytes.len() < 4096 {
                let r = next_rand(&mut state);
                if r % 11 == 0 {
                    bytes.extend_from_slice(&[0, 0, 1]);
                }
                bytes.push((r >> 8) as u8);
            }
            for codec in [CodecKind::H264, CodecKind::Hevc] {
                let (mut w, mut p) = window_with(&bytes);
                while let Extraction::Unit(unit) = extract(&w, &mut p, codec) {
                    assert!(unit.end > unit.start, "seed {seed}: empty unit");
                    assert!(unit.start >= w.read_cursor());
                    assert!(p.consumed + p.skipped <= p.total_read, "seed {seed}");
                    w.advance_to(unit.end);
                }
            }
        }
    }

    #[test]
    fn find_start_code_respects_offset() {
        let bytes = [0, 0, 1, 5, 0, 0, 1, 6];
        assert_eq!(find_start_code(&bytes, 0), Some(0));
        assert_eq!(find_start_code(&bytes, 1), Some(4));
        assert_eq!(find_start_code(&bytes, 6), None);
    }
}
