use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];

/// Time offset between the local clock and SolarNet. SNWS2 signatures are
/// rejected when the request date drifts too far from the server clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeSync {
    offset_secs: i64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(offset_secs: i64) -> Self {
        Self { offset_secs }
    }

    /// Fetch server time from the SolarNet `Date` header and compute the drift.
    pub async fn sync(&mut self, base_url: &str) -> Result<()> {
        let client = reqwest::Client::new();
        let resp = client.head(base_url).send().await?;

        if let Some(date_header) = resp.headers().get("date") {
            let server_time = parse_http_date(date_header.to_str()?)?;
            let local_time = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
            self.offset_secs = server_time as i64 - local_time;
            debug!(offset = self.offset_secs, "synchronized clock with {}", base_url);

            if self.offset_secs.abs() > 30 {
                warn!(
                    "local clock is {}s off from SolarNet; using server time for signing",
                    self.offset_secs
                );
            }
        }

        Ok(())
    }

    /// Corrected current time.
    pub fn now(&self) -> SystemTime {
        let local = SystemTime::now();
        if self.offset_secs >= 0 {
            local + Duration::from_secs(self.offset_secs as u64)
        } else {
            local - Duration::from_secs(self.offset_secs.unsigned_abs())
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset_secs
    }
}

/// Broken-down UTC time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcTime {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub weekday: usize,
}

impl UtcTime {
    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs();
        Self::from_unix(secs)
    }

    pub fn from_unix(secs: u64) -> Self {
        let days = (secs / 86400) as i64;
        let rem = secs % 86400;
        let (year, month, day) = civil_from_days(days);
        Self {
            year,
            month,
            day,
            hour: (rem / 3600) as u32,
            minute: ((rem % 3600) / 60) as u32,
            second: (rem % 60) as u32,
            weekday: (days % 7) as usize,
        }
    }
}

/// RFC 1123 date as sent in the `X-SN-Date` header: "Tue, 15 Nov 1994 08:12:31 GMT".
pub fn format_http_date(time: SystemTime) -> String {
    let t = UtcTime::from_system_time(time);
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[t.weekday],
        t.day,
        MONTHS[(t.month - 1) as usize],
        t.year,
        t.hour,
        t.minute,
        t.second
    )
}

/// Compact date used in the SNWS2 string to sign: "19941115T081231Z".
pub fn format_iso_basic(time: SystemTime) -> String {
    let t = UtcTime::from_system_time(time);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    )
}

/// Day stamp used in the SNWS2 signing key: "19941115".
pub fn format_day_stamp(time: SystemTime) -> String {
    let t = UtcTime::from_system_time(time);
    format!("{:04}{:02}{:02}", t.year, t.month, t.day)
}

/// Parse HTTP date format "Sun, 02 Feb 2026 19:30:00 GMT" to Unix timestamp.
pub fn parse_http_date(s: &str) -> Result<u64> {
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() < 5 {
        anyhow::bail!("Invalid HTTP date format: {}", s);
    }

    let day: u32 = parts[1].parse()?;
    let month = MONTHS
        .iter()
        .position(|m| *m == parts[2])
        .map(|i| i as u32 + 1)
        .ok_or_else(|| anyhow::anyhow!("Invalid month: {}", parts[2]))?;
    let year: u32 = parts[3].parse()?;
    let time_parts: Vec<&str> = parts[4].split(':').collect();
    if time_parts.len() != 3 {
        anyhow::bail!("Invalid time format: {}", parts[4]);
    }
    let hour: u32 = time_parts[0].parse()?;
    let minute: u32 = time_parts[1].parse()?;
    let second: u32 = time_parts[2].parse()?;

    let days = days_from_civil(year, month, day);
    let timestamp = days as u64 * 86400 + hour as u64 * 3600 + minute as u64 * 60 + second as u64;
    Ok(timestamp)
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Convert year/month/day to days since Unix epoch.
fn days_from_civil(y: u32, m: u32, d: u32) -> i64 {
    let y = y as i64;
    let m = m as i64;
    let d = d as i64;

    let y = if m <= 2 { y - 1 } else { y };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Inverse of `days_from_civil`.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
