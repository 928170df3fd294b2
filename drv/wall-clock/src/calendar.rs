//! Gregorian calendar conversion and the Central European DST rule,
//! recovered from `RTC_Seconds2UTC`, `RTC_Date2Seconds` and the `RTC_DST`
//! macro. The day/month/year math itself uses the standard
//! days-since-epoch <-> civil-date algorithm (equivalent to, but more
//! direct than, the original's iterative year/month subtraction loop);
//! the weekday fencepost and the DST transition rule are preserved
//! exactly as the original computes them.

/// A local calendar timestamp: everything a subscriber needs to detect a
/// field rollover or render a clock face.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Utc {
    pub year: u16,
    /// 1-12.
    pub month: u8,
    /// 1-31.
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
}

const SECS_PER_DAY: u32 = 86_400;
/// Fixed Central European base offset; DST, when in effect, adds one more
/// hour on top of this.
const LOCAL_BASE_OFFSET_SECS: u32 = 3_600;

/// Converts raw UTC epoch seconds into the local calendar fields the
/// original firmware hands to its clients (already offset and, if
/// applicable, DST-adjusted).
pub fn seconds_to_utc(local_seconds: u32) -> Utc {
    let days = (local_seconds / SECS_PER_DAY) as i64;
    let sod = local_seconds % SECS_PER_DAY;
    let (year, month, day) = civil_from_days(days);
    Utc {
        year: year as u16,
        month,
        day,
        hour: (sod / 3_600) as u8,
        minute: ((sod % 3_600) / 60) as u8,
        second: (sod % 60) as u8,
        day_of_week: day_of_week(days),
    }
}

/// Inverse of [`seconds_to_utc`]: local calendar fields back to the
/// (local) epoch-second count they represent.
pub fn utc_to_seconds(utc: &Utc) -> u32 {
    let days = days_from_civil(utc.year as i64, utc.month as u32, utc.day as u32);
    (days as u32) * SECS_PER_DAY
        + utc.hour as u32 * 3_600
        + utc.minute as u32 * 60
        + utc.second as u32
}

/// Applies the fixed local-zone offset and, if the date falls inside the
/// DST window, the extra hour, to raw UTC epoch seconds.
pub fn local_seconds(utc_epoch_seconds: u32) -> u32 {
    let utc_date = seconds_to_utc(utc_epoch_seconds);
    let mut local = utc_epoch_seconds.wrapping_add(LOCAL_BASE_OFFSET_SECS);
    if is_dst(&utc_date) {
        local = local.wrapping_add(3_600);
    }
    local
}

/// Day of week for `days_since_epoch` (1970-01-01 = day 0), 0 = Sunday.
/// The original counts 1970-01-01 itself as day 1 before applying the
/// `+4 mod 7` weekday rule; that `+1` is preserved here.
pub fn day_of_week(days_since_epoch: i64) -> u8 {
    (days_since_epoch + 1 + 4).rem_euclid(7) as u8
}

/// The Central European DST rule: in effect April through September, and
/// from the last Sunday of March 01:00 UTC through the last Sunday of
/// October 01:00 UTC.
pub fn is_dst(utc: &Utc) -> bool {
    match utc.month {
        4..=9 => true,
        3 => last_sunday_transition_passed(utc),
        10 => !last_sunday_transition_passed(utc),
        _ => false,
    }
}

fn last_sunday_transition_passed(utc: &Utc) -> bool {
    let last_sunday = last_sunday_of_month(utc.year, utc.month);
    match utc.day.cmp(&last_sunday) {
        core::cmp::Ordering::Less => false,
        core::cmp::Ordering::Greater => true,
        core::cmp::Ordering::Equal => utc.hour >= 1,
    }
}

fn last_sunday_of_month(year: u16, month: u8) -> u8 {
    let last_day = days_in_month(year, month);
    let days = days_from_civil(year as i64, month as u32, last_day as u32);
    last_day - day_of_week(days)
}

fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

/// Days-since-epoch to (year, month 1-12, day 1-31). Howard Hinnant's
/// `civil_from_days`, the standard constant-time inverse of the Julian
/// day count.
fn civil_from_days(z: i64) -> (i64, u8, u8) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// The inverse of [`civil_from_days`].
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}
