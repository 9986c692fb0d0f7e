//! Leap-second table and TAI/UTC offset arithmetic.

pub(crate) const NSEC_PER_SEC: i64 = 1_000_000_000;

/// TAI−UTC offsets, keyed by the POSIX second (UTC) at which each takes effect.
const LEAP_SECONDS: &[(i64, i64)] = &[
    (63_072_000, 10),    // 1972-01-01
    (78_796_800, 11),    // 1972-07-01
    (94_694_400, 12),    // 1973-01-01
    (126_230_400, 13),   // 1974-01-01
    (157_766_400, 14),   // 1975-01-01
    (189_302_400, 15),   // 1976-01-01
    (220_924_800, 16),   // 1977-01-01
    (252_460_800, 17),   // 1978-01-01
    (283_996_800, 18),   // 1979-01-01
    (315_532_800, 19),   // 1980-01-01
    (362_793_600, 20),   // 1981-07-01
    (394_329_600, 21),   // 1982-07-01
    (425_865_600, 22),   // 1983-07-01
    (489_024_000, 23),   // 1985-07-01
    (567_993_600, 24),   // 1988-01-01
    (631_152_000, 25),   // 1990-01-01
    (662_688_000, 26),   // 1991-01-01
    (709_948_800, 27),   // 1992-07-01
    (741_484_800, 28),   // 1993-07-01
    (773_020_800, 29),   // 1994-07-01
    (820_454_400, 30),   // 1996-01-01
    (867_715_200, 31),   // 1997-07-01
    (915_148_800, 32),   // 1999-01-01
    (1_136_073_600, 33), // 2006-01-01
    (1_230_768_000, 34), // 2009-01-01
    (1_341_100_800, 35), // 2012-07-01
    (1_435_708_800, 36), // 2015-07-01
    (1_483_228_800, 37), // 2017-01-01
];

/// Offset used before 1972, when UTC was not yet tied to whole SI seconds.
const PRE_1972_OFFSET: i64 = 10;

/// TAI−UTC in seconds at the given POSIX second.
pub(crate) fn tai_minus_utc(utc_unix_secs: i64) -> i64 {
    let idx = LEAP_SECONDS.partition_point(|&(start, _)| start <= utc_unix_secs);
    if idx == 0 {
        PRE_1972_OFFSET
    } else {
        LEAP_SECONDS[idx - 1].1
    }
}

/// Convert TAI nanoseconds (since 1970-01-01 TAI) to a POSIX second and a
/// nanosecond part. During a leap second the nanosecond part is in
/// `[1e9, 2e9)` and the second is the `23:59:59` preceding it, matching
/// chrono's leap-second representation.
pub(crate) fn utc_from_tai(tai_nsec: i64) -> (i64, u32) {
    for idx in (0..LEAP_SECONDS.len()).rev() {
        let (start, offset) = LEAP_SECONDS[idx];
        let previous = if idx == 0 {
            PRE_1972_OFFSET
        } else {
            LEAP_SECONDS[idx - 1].1
        };

        let tai_start = (start + offset) * NSEC_PER_SEC;
        if tai_nsec >= tai_start {
            return split(tai_nsec - offset * NSEC_PER_SEC);
        }

        let leap_begin = (start + previous) * NSEC_PER_SEC;
        if tai_nsec >= leap_begin {
            let into_leap = tai_nsec - leap_begin;
            return (start - 1, (NSEC_PER_SEC + into_leap) as u32);
        }
    }
    split(tai_nsec - PRE_1972_OFFSET * NSEC_PER_SEC)
}

fn split(nsec: i64) -> (i64, u32) {
    (
        nsec.div_euclid(NSEC_PER_SEC),
        nsec.rem_euclid(NSEC_PER_SEC) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_offset_is_37_seconds() {
        // 2020-01-01T00:00:00Z
        assert_eq!(tai_minus_utc(1_577_836_800), 37);
    }

    #[test]
    fn test_offset_boundaries() {
        assert_eq!(tai_minus_utc(0), 10);
        assert_eq!(tai_minus_utc(1_483_228_799), 36);
        assert_eq!(tai_minus_utc(1_483_228_800), 37);
    }

    #[test]
    fn test_leap_second_maps_to_23_59_60() {
        // TAI instant half-way through the leap second inserted at the end of 2016.
        let leap_begin = (1_483_228_800 + 36) * NSEC_PER_SEC;
        let (secs, nanos) = utc_from_tai(leap_begin + 500_000_000);
        assert_eq!(secs, 1_483_228_799);
        assert_eq!(nanos, 1_500_000_000);
    }

    #[test]
    fn test_utc_from_tai_after_leap() {
        let tai = (1_483_228_800 + 37) * NSEC_PER_SEC;
        assert_eq!(utc_from_tai(tai), (1_483_228_800, 0));
    }
}
