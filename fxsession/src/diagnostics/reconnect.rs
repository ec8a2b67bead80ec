use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::{self, BufRead};
use std::time::Duration;

/// What a log line says happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Disconnected,
    ReconnectScheduled { attempt: Option<u32> },
    ConnectStarted,
    Connected,
    AppAuthSent,
    AppAuthorized,
    AccountAuthorized,
    FundsTimeout,
    RequestDeferred,
    DnsLookupFailed,
    AppAuthTimeout,
    RuntimeStalled,
    RuntimeResumed,
    Lockout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectEvent {
    pub timestamp: NaiveDateTime,
    pub kind: EventKind,
    /// Line text after the timestamp
    pub reason: String,
}

/// Marker substrings, matched against the lowercased line. A line can carry several events.
const MARKERS: &[(&[&str], Marker)] = &[
    (&["transport lost", "偵測到斷線", "[network] 已斷線"], Marker::Disconnected),
    (&["reconnect scheduled", "後重連"], Marker::ReconnectScheduled),
    (&["connecting to broker", "正在連線到 ctrader"], Marker::ConnectStarted),
    (&["transport connected", "已連線！"], Marker::Connected),
    (&["application auth sent", "正在發送應用程式認證"], Marker::AppAuthSent),
    (
        &["application authorized", "應用程式認證成功", "應用程式已授權"],
        Marker::AppAuthorized,
    ),
    (
        &["account authorized", "帳戶認證成功", "帳戶已授權"],
        Marker::AccountAuthorized,
    ),
    (
        &["account funds request timed out", "[timeout] 取得帳戶資金逾時"],
        Marker::FundsTimeout,
    ),
    (&["dns lookup failed"], Marker::DnsLookupFailed),
    (&["application auth timed out", "app 認證逾時"], Marker::AppAuthTimeout),
    (&["runtime_stalled"], Marker::RuntimeStalled),
    (&["runtime_resume"], Marker::RuntimeResumed),
    (&["lockout"], Marker::Lockout),
];

#[derive(Debug, Clone, Copy)]
enum Marker {
    Disconnected,
    ReconnectScheduled,
    ConnectStarted,
    Connected,
    AppAuthSent,
    AppAuthorized,
    AccountAuthorized,
    FundsTimeout,
    DnsLookupFailed,
    AppAuthTimeout,
    RuntimeStalled,
    RuntimeResumed,
    Lockout,
}

fn classify(line: &str) -> Vec<EventKind> {
    let lower = line.to_lowercase();
    let mut kinds: Vec<EventKind> = MARKERS
        .iter()
        .filter(|(needles, _)| needles.iter().any(|needle| lower.contains(needle)))
        .filter_map(|(_, marker)| match marker {
            // A schedule line must name its attempt
            Marker::ReconnectScheduled if !lower.contains("attempt") => None,
            Marker::ReconnectScheduled => Some(EventKind::ReconnectScheduled {
                attempt: parse_attempt(&lower),
            }),
            Marker::Disconnected => Some(EventKind::Disconnected),
            Marker::ConnectStarted => Some(EventKind::ConnectStarted),
            Marker::Connected => Some(EventKind::Connected),
            Marker::AppAuthSent => Some(EventKind::AppAuthSent),
            Marker::AppAuthorized => Some(EventKind::AppAuthorized),
            Marker::AccountAuthorized => Some(EventKind::AccountAuthorized),
            Marker::FundsTimeout => Some(EventKind::FundsTimeout),
            Marker::DnsLookupFailed => Some(EventKind::DnsLookupFailed),
            Marker::AppAuthTimeout => Some(EventKind::AppAuthTimeout),
            Marker::RuntimeStalled => Some(EventKind::RuntimeStalled),
            Marker::RuntimeResumed => Some(EventKind::RuntimeResumed),
            Marker::Lockout => Some(EventKind::Lockout),
        })
        .collect();

    if lower.contains("deferred")
        && (lower.contains("請求逾時或失敗") || lower.contains("request deferred"))
    {
        kinds.push(EventKind::RequestDeferred);
    }
    kinds
}

/// Number following the first `attempt` (`attempt 3`, `attempt=3`).
fn parse_attempt(lower: &str) -> Option<u32> {
    let (_, rest) = lower.split_once("attempt")?;
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=' || c == ':');
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Assigns dates to time-only lines, rolling over midnight when time goes backwards.
#[derive(Debug, Default)]
struct LineClock {
    date: NaiveDate,
    last: Option<NaiveDateTime>,
}

impl LineClock {
    /// Returns the timestamp and the rest of the line.
    fn stamp<'a>(&mut self, line: &'a str) -> Option<(NaiveDateTime, &'a str)> {
        let (timestamp, rest) = self.parse(line)?;
        self.date = timestamp.date();
        self.last = Some(timestamp);
        Some((timestamp, rest))
    }

    fn parse<'a>(&self, line: &'a str) -> Option<(NaiveDateTime, &'a str)> {
        if let Some(inner) = line.strip_prefix('[') {
            let (stamp, rest) = inner.split_once(']')?;
            if let Ok(full) = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S") {
                return Some((full, rest));
            }
            let time = NaiveTime::parse_from_str(stamp, "%H:%M:%S").ok()?;
            let mut timestamp = self.date.and_time(time);
            if self.last.is_some_and(|last| timestamp < last) {
                timestamp = self.date.succ_opt()?.and_time(time);
            }
            return Some((timestamp, rest));
        }

        let (token, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let parsed = DateTime::parse_from_rfc3339(token).ok()?;
        Some((parsed.naive_utc(), rest))
    }
}

/// Lazy, single-pass parse of a reconnect log.
///
/// Lines without a marker are ignored. Marked lines without a usable timestamp are skipped
/// and counted as malformed. A read error ends the scan; see [`ReconnectEvents::finish`].
pub struct ReconnectEvents<R> {
    reader: R,
    buf: Vec<u8>,
    clock: LineClock,
    pending: VecDeque<ReconnectEvent>,
    lines: u64,
    malformed: u64,
    error: Option<io::Error>,
    done: bool,
}

impl<R: BufRead> ReconnectEvents<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            clock: LineClock::default(),
            pending: VecDeque::new(),
            lines: 0,
            malformed: 0,
            error: None,
            done: false,
        }
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Surface the read error that ended the scan, if any.
    pub fn finish(self) -> io::Result<()> {
        self.error.map_or(Ok(()), Err)
    }

    fn read_line(&mut self) -> Option<String> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.lines += 1;
                Some(String::from_utf8_lossy(&self.buf).trim_end().to_string())
            }
            Err(err) => {
                self.error = Some(err);
                None
            }
        }
    }
}

impl<R: BufRead> Iterator for ReconnectEvents<R> {
    type Item = ReconnectEvent;

    fn next(&mut self) -> Option<ReconnectEvent> {
        while self.pending.is_empty() {
            if self.done {
                return None;
            }
            let Some(line) = self.read_line() else {
                self.done = true;
                return None;
            };
            let kinds = classify(&line);
            if kinds.is_empty() {
                continue;
            }
            let Some((timestamp, rest)) = self.clock.stamp(line.trim_start()) else {
                self.malformed += 1;
                continue;
            };
            let reason = rest.trim().to_string();
            self.pending.extend(kinds.into_iter().map(|kind| ReconnectEvent {
                timestamp,
                kind,
                reason: reason.clone(),
            }));
        }
        self.pending.pop_front()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectStats {
    pub lines: u64,
    pub malformed_lines: u64,
    pub disconnect_events: u64,
    pub reconnect_scheduled: u64,
    pub max_attempt: u32,
    pub connect_started: u64,
    pub connected: u64,
    pub app_auth_sent: u64,
    pub app_auth_success: u64,
    pub account_auth_success: u64,
    pub funds_timeout: u64,
    pub request_deferred: u64,
    pub dns_lookup_failed: u64,
    pub app_auth_timeout: u64,
    pub runtime_stalled: u64,
    pub runtime_resume: u64,
    pub lockout: u64,
    /// Outages closed by an account authorization
    pub reconnects: u64,
    pub total_downtime: Duration,
    pub longest_downtime: Duration,
    pub first_event: Option<NaiveDateTime>,
    pub last_event: Option<NaiveDateTime>,
    outage_started: Option<NaiveDateTime>,
}

impl ReconnectStats {
    pub fn record(&mut self, event: &ReconnectEvent) {
        self.first_event.get_or_insert(event.timestamp);
        self.last_event = Some(event.timestamp);

        match event.kind {
            EventKind::Disconnected => {
                self.disconnect_events += 1;
                self.outage_started.get_or_insert(event.timestamp);
            }
            EventKind::ReconnectScheduled { attempt } => {
                self.reconnect_scheduled += 1;
                if let Some(attempt) = attempt {
                    self.max_attempt = self.max_attempt.max(attempt);
                }
            }
            EventKind::ConnectStarted => self.connect_started += 1,
            EventKind::Connected => self.connected += 1,
            EventKind::AppAuthSent => self.app_auth_sent += 1,
            EventKind::AppAuthorized => self.app_auth_success += 1,
            EventKind::AccountAuthorized => {
                self.account_auth_success += 1;
                if let Some(started) = self.outage_started.take() {
                    let downtime = (event.timestamp - started).to_std().unwrap_or_default();
                    self.reconnects += 1;
                    self.total_downtime += downtime;
                    self.longest_downtime = self.longest_downtime.max(downtime);
                }
            }
            EventKind::FundsTimeout => self.funds_timeout += 1,
            EventKind::RequestDeferred => self.request_deferred += 1,
            EventKind::DnsLookupFailed => self.dns_lookup_failed += 1,
            EventKind::AppAuthTimeout => self.app_auth_timeout += 1,
            EventKind::RuntimeStalled => self.runtime_stalled += 1,
            EventKind::RuntimeResumed => self.runtime_resume += 1,
            EventKind::Lockout => self.lockout += 1,
        }
    }

    /// Application authorizations per scheduled reconnect, 0 when none were scheduled.
    pub fn reconnect_success_ratio(&self) -> f64 {
        if self.reconnect_scheduled == 0 {
            return 0.0;
        }
        self.app_auth_success as f64 / self.reconnect_scheduled as f64
    }

    /// Whether the log ends in the middle of an outage.
    pub fn outage_open(&self) -> bool {
        self.outage_started.is_some()
    }
}

/// Scan `reader` once and aggregate its events.
pub fn analyze<R: BufRead>(reader: R) -> io::Result<ReconnectStats> {
    let mut events = ReconnectEvents::new(reader);
    let mut stats = ReconnectStats::default();
    for event in events.by_ref() {
        stats.record(&event);
    }
    stats.lines = events.lines();
    stats.malformed_lines = events.malformed();
    events.finish()?;
    Ok(stats)
}

pub fn render(stats: &ReconnectStats) -> String {
    let stamp = |ts: Option<NaiveDateTime>| {
        ts.map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    let mut out = String::from("Reconnect Log Summary\n");
    let rows: [(&str, String); 22] = [
        ("lines", stats.lines.to_string()),
        ("malformed_lines", stats.malformed_lines.to_string()),
        ("disconnect_events", stats.disconnect_events.to_string()),
        ("reconnect_scheduled", stats.reconnect_scheduled.to_string()),
        ("max_attempt", stats.max_attempt.to_string()),
        ("connect_started", stats.connect_started.to_string()),
        ("connected", stats.connected.to_string()),
        ("app_auth_sent", stats.app_auth_sent.to_string()),
        ("app_auth_success", stats.app_auth_success.to_string()),
        ("account_auth_success", stats.account_auth_success.to_string()),
        ("funds_timeout", stats.funds_timeout.to_string()),
        ("request_deferred", stats.request_deferred.to_string()),
        ("dns_lookup_failed", stats.dns_lookup_failed.to_string()),
        ("app_auth_timeout", stats.app_auth_timeout.to_string()),
        ("runtime_stalled", stats.runtime_stalled.to_string()),
        ("runtime_resume", stats.runtime_resume.to_string()),
        ("lockout", stats.lockout.to_string()),
        ("reconnects", stats.reconnects.to_string()),
        ("total_downtime", format!("{}s", stats.total_downtime.as_secs())),
        ("longest_downtime", format!("{}s", stats.longest_downtime.as_secs())),
        ("first_event", stamp(stats.first_event)),
        ("last_event", stamp(stats.last_event)),
    ];
    for (label, value) in rows {
        let _ = writeln!(out, "{}: {}", label, value);
    }
    let _ = write!(
        out,
        "reconnect_success_ratio: {:.2}",
        stats.reconnect_success_ratio()
    );
    out
}
