//! Property-based tests for the send window.
//!
//! These tests use proptest to generate random operation sequences and
//! verify that the framing and ring invariants hold for all of them.

use proptest::prelude::*;

use marlinfeed_protocol::SendWindow;

/// Strategy for a raw G-code payload that survives cleaning: printable
/// ASCII without ';', with at least one non-space byte.
fn payload() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][A-Za-z0-9 .+-]{0,20}")
        .expect("payload regex strategy")
}

/// One step of a randomized window exercise.
#[derive(Debug, Clone)]
enum Op {
    Append(String),
    Next,
    Ack,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => payload().prop_map(Op::Append),
        3 => Just(Op::Next),
        2 => Just(Op::Ack),
    ]
}

/// Checks the wire format of one frame and returns (line number, payload).
fn check_frame(frame: &[u8]) -> (usize, Vec<u8>) {
    assert_eq!(frame[0], b'N', "frame must start with N");
    assert_eq!(*frame.last().unwrap(), b'\n', "frame must end with newline");
    let star = frame
        .iter()
        .rposition(|&b| b == b'*')
        .expect("frame must contain '*'");
    let chk: u8 = frame[..star].iter().fold(0, |acc, &b| acc ^ b);
    let chk_text = std::str::from_utf8(&frame[star + 1..frame.len() - 1]).unwrap();
    assert_eq!(chk_text, chk.to_string(), "checksum must be the XOR fold");

    let mut digits = 1;
    while frame[digits].is_ascii_digit() {
        digits += 1;
    }
    let number: usize = std::str::from_utf8(&frame[1..digits]).unwrap().parse().unwrap();
    (number, frame[digits..star].to_vec())
}

proptest! {
    /// Every accepted append produces a well-formed frame whose checksum
    /// is the XOR of all preceding bytes.
    #[test]
    fn prop_appended_frames_are_well_formed(payloads in prop::collection::vec(payload(), 1..40)) {
        let mut w = SendWindow::new();
        w.set_buf_size(100_000);
        let mut expected_number = 0usize;
        for p in &payloads {
            if w.max_append_len() < p.len() {
                break;
            }
            w.append(p.as_bytes());
            while w.has_next() {
                let frame = w.next();
                let (number, payload) = check_frame(&frame);
                if number == 99 {
                    prop_assert_eq!(&frame[..], b"N99M110N-1*97\n");
                    continue;
                }
                prop_assert_eq!(number, expected_number);
                prop_assert_eq!(payload, p.trim().as_bytes().to_vec());
                expected_number = (expected_number + 1) % 99;
            }
        }
    }

    /// The sum of unacknowledged frame lengths never exceeds the
    /// configured printer buffer size, for any operation sequence that
    /// respects max_append_len.
    #[test]
    fn prop_outstanding_bytes_bounded(ops in prop::collection::vec(op(), 1..200)) {
        let buf_size = 128usize;
        let mut w = SendWindow::new();
        let mut outstanding = 0usize; // model of unacked bytes
        let mut queued: std::collections::VecDeque<usize> = Default::default();

        for op in ops {
            match op {
                Op::Append(p) => {
                    let cleaned = p.trim();
                    if cleaned.is_empty() || cleaned.len() > w.max_append_len() {
                        continue;
                    }
                    w.append(cleaned.as_bytes());
                }
                Op::Next => {
                    if w.has_next() {
                        let frame = w.next();
                        outstanding += frame.len();
                        queued.push_back(frame.len());
                    }
                }
                Op::Ack => {
                    let acked = w.ack();
                    prop_assert_eq!(acked, !queued.is_empty());
                    if let Some(len) = queued.pop_front() {
                        outstanding -= len;
                    }
                }
            }
            prop_assert!(outstanding <= buf_size,
                "transmitted-but-unacked bytes {} exceed printer buffer {}", outstanding, buf_size);
        }
    }

    /// FIFO: the n-th ack ever performed acknowledges the n-th frame ever
    /// appended, and replay after seek() reproduces the stored frames in
    /// ring order.
    #[test]
    fn prop_seek_replays_in_ring_order(count in 2usize..60, back in 1usize..60) {
        let mut w = SendWindow::new();
        w.set_buf_size(100_000);
        let mut frames = Vec::new();
        for i in 0..count {
            w.append(format!("G{}", i).as_bytes());
        }
        while w.has_next() {
            frames.push(w.next().to_vec());
        }

        let back = back.min(count);
        let target = (count - back) as i64;
        prop_assert!(w.seek(target));
        let mut replayed = Vec::new();
        while w.has_next() {
            replayed.push(w.next().to_vec());
        }
        prop_assert_eq!(&replayed[..], &frames[count - back..]);

        // acks release frames strictly in append order
        for frame in &frames {
            prop_assert!(w.ack());
            let (number, _) = check_frame(frame);
            prop_assert!(number < count);
        }
        prop_assert!(!w.ack());
    }
}
