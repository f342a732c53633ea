//! Classification of printer replies.
//!
//! Marlin replies are line-based ASCII. A small grammar of case-sensitive
//! prefixes covers everything the engine reacts to:
//!
//! - `ok` (word boundary) — positive acknowledgement, possibly followed by
//!   a temperature report on the same line.
//! - `T:` / `T0:` / `T1:` / `B:` — temperature report; each value may be
//!   followed by `/<target>`.
//! - `Error:<text>` — error condition; opens an error window rather than
//!   aborting immediately.
//! - `Resend:<n>` — replay request, usually accompanied by its own `ok`
//!   which must not count as an acknowledgement.
//! - anything else — echoed to the log, does not advance the protocol.

use crate::line::Line;

/// What a reply line means to the engine. `Ok` and `Resend` report how
/// many bytes of the line the match consumed, so the remainder can be
/// re-examined (a temperature report after `ok`, the line number after
/// `Resend:`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledgement of the oldest outstanding frame.
    Ok { matched: usize },
    /// A temperature report line.
    Temperature,
    /// `Error:` line; starts/extends the error window.
    Error,
    /// `Resend:` request; `matched` covers the prefix and any whitespace.
    Resend { matched: usize },
    /// Unclassified printer chatter.
    Other,
}

/// Classifies one reply line.
pub fn classify(line: &Line) -> Reply {
    let idx = line.prefix_match("ok\u{8}");
    if idx != 0 {
        return Reply::Ok { matched: idx };
    }
    if line.prefix_match("T:") != 0
        || line.prefix_match("T0:") != 0
        || line.prefix_match("T1:") != 0
        || line.prefix_match("B:") != 0
    {
        return Reply::Temperature;
    }
    if line.prefix_match("Error:") != 0 {
        return Reply::Error;
    }
    let idx = line.prefix_match("Resend:\u{8}");
    if idx != 0 {
        return Reply::Resend { matched: idx };
    }
    Reply::Other
}

/// One pass over a temperature report. Fields stay `None` when the report
/// does not mention them, so a partial report only updates what it names.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemperatureReport {
    /// `[actual, target]` per hotend.
    pub tool: [[Option<f64>; 2]; 2],
    /// `[actual, target]` for the bed.
    pub bed: [Option<f64>; 2],
}

/// Scans a temperature report such as
/// `ok T:25.9 /0.0 B:50.0 /50.0 T0:25.9 /0.0 @:0 B@:0`.
///
/// `T:` reports the active hotend (mapped to tool 0 like `T0:`), a `/`
/// introduces the preceding sensor's target, and unknown `@:`-style fields
/// are skipped.
pub fn parse_temperature_report(data: &[u8]) -> TemperatureReport {
    #[derive(Clone, Copy)]
    enum Sensor {
        Tool(usize),
        Bed,
    }

    let mut report = TemperatureReport::default();
    let mut sensor: Option<Sensor> = None;
    let mut idx = 0usize;
    let mut p = 0usize;

    while p < data.len() {
        if data[p..].starts_with(b"T:") {
            p += 2;
            sensor = Some(Sensor::Tool(0));
            idx = 0;
        } else if data[p..].starts_with(b"T0:") {
            p += 3;
            sensor = Some(Sensor::Tool(0));
            idx = 0;
        } else if data[p..].starts_with(b"T1:") {
            p += 3;
            sensor = Some(Sensor::Tool(1));
            idx = 0;
        } else if data[p..].starts_with(b"B:") {
            p += 2;
            sensor = Some(Sensor::Bed);
            idx = 0;
        } else if data[p] == b'/' {
            idx = 1;
            p += 1;
        } else {
            // skip an unrecognized field up to and including its ':'
            while p < data.len() && data[p] != b':' {
                p += 1;
            }
            if p < data.len() {
                p += 1;
            }
            sensor = None;
        }

        let (value, consumed) = crate::line::parse_f64_prefix(&data[p..]);
        p += consumed;
        while p < data.len() && data[p].is_ascii_whitespace() {
            p += 1;
        }

        if consumed > 0 {
            match sensor {
                Some(Sensor::Tool(t)) => report.tool[t][idx] = Some(value),
                Some(Sensor::Bed) => report.bed[idx] = Some(value),
                None => {}
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ok() {
        assert_eq!(classify(&Line::from("ok")), Reply::Ok { matched: 2 });
        assert_eq!(classify(&Line::from("ok\n")), Reply::Ok { matched: 3 });
        assert_eq!(
            classify(&Line::from("ok T:25.0\n")),
            Reply::Ok { matched: 3 }
        );
        // 'okay' is not an ack
        assert_eq!(classify(&Line::from("okay\n")), Reply::Other);
    }

    #[test]
    fn test_classify_temperature() {
        assert_eq!(classify(&Line::from("T:25.91 E:0 B:48.1\n")), Reply::Temperature);
        assert_eq!(classify(&Line::from("B:50.0 /50.0\n")), Reply::Temperature);
        assert_eq!(classify(&Line::from("T0:25.9 /0.0\n")), Reply::Temperature);
    }

    #[test]
    fn test_classify_error_and_resend() {
        assert_eq!(classify(&Line::from("Error:checksum mismatch\n")), Reply::Error);
        match classify(&Line::from("Resend: 7\n")) {
            Reply::Resend { matched } => {
                let mut line = Line::from("Resend: 7\n");
                line.slice_from(matched as isize);
                assert_eq!(line.number(), 7);
            }
            other => panic!("expected Resend, got {:?}", other),
        }
        // case-sensitive
        assert_eq!(classify(&Line::from("resend: 7\n")), Reply::Other);
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(classify(&Line::from("echo:busy: processing\n")), Reply::Other);
        assert_eq!(classify(&Line::from("start\n")), Reply::Other);
    }

    #[test]
    fn test_temperature_report_m105_style() {
        let r = parse_temperature_report(b"T:25.9 /0.0 B:50.0 /50.0 T0:25.9 /0.0 @:0 B@:0");
        assert_eq!(r.tool[0][0], Some(25.9));
        assert_eq!(r.tool[0][1], Some(0.0));
        assert_eq!(r.bed[0], Some(50.0));
        assert_eq!(r.bed[1], Some(50.0));
        assert_eq!(r.tool[1][0], None);
    }

    #[test]
    fn test_temperature_report_m190_style() {
        let r = parse_temperature_report(b"T:25.91 E:0 B:48.1");
        assert_eq!(r.tool[0][0], Some(25.91));
        assert_eq!(r.bed[0], Some(48.1));
        assert_eq!(r.bed[1], None);
    }

    #[test]
    fn test_temperature_report_dual_hotend() {
        let r = parse_temperature_report(b"T0:210.0 /210.0 T1:45.2 /0.0 B:60.0 /60.0");
        assert_eq!(r.tool[0][0], Some(210.0));
        assert_eq!(r.tool[0][1], Some(210.0));
        assert_eq!(r.tool[1][0], Some(45.2));
        assert_eq!(r.tool[1][1], Some(0.0));
        assert_eq!(r.bed[0], Some(60.0));
    }

    #[test]
    fn test_temperature_report_heating_wait() {
        // M109 progress lines carry W:? which must be skipped gracefully
        let r = parse_temperature_report(b"T:100.0 E:0 W:?");
        assert_eq!(r.tool[0][0], Some(100.0));
        assert_eq!(r.bed, [None, None]);
    }

    #[test]
    fn test_temperature_report_garbage() {
        let r = parse_temperature_report(b"no temperatures here");
        assert_eq!(r, TemperatureReport::default());
    }
}
