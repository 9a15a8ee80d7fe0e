use std::io::Write;

use sha2::{Digest, Sha256};

use crate::repo::hashsink::{HashSink, EXIF_CAPTURE_LIMIT};

#[test]
fn checksum_covers_every_byte() {
    let mut sink = HashSink::new(Vec::new());
    sink.write_all(b"hello ").unwrap();
    sink.write_all(b"world").unwrap();
    let (checksum, _) = sink.finish().unwrap();

    let expected: [u8; 32] = Sha256::digest(b"hello world").into();
    assert_eq!(checksum, expected);
}

#[test]
fn destination_receives_every_byte() {
    let mut sink = HashSink::new(Vec::new());
    sink.write_all(b"abc").unwrap();
    sink.write_all(b"def").unwrap();
    let (_, prefix) = sink.finish().unwrap();
    assert_eq!(prefix, b"abcdef");
}

#[test]
fn capture_stops_at_the_limit_without_stalling() {
    let mut sink = HashSink::new(Vec::new());
    // Write well past the capture limit in uneven chunks; the capture
    // flips to a no-op and the writes keep succeeding.
    let chunk = vec![0xABu8; 100_000];
    let mut total = 0usize;
    while total < EXIF_CAPTURE_LIMIT + 300_000 {
        sink.write_all(&chunk).unwrap();
        total += chunk.len();
    }
    let (checksum, prefix) = sink.finish().unwrap();

    assert_eq!(prefix.len(), EXIF_CAPTURE_LIMIT);
    assert!(prefix.iter().all(|&b| b == 0xAB));

    let mut hasher = Sha256::new();
    let mut hashed = 0usize;
    while hashed < total {
        hasher.update(&chunk);
        hashed += chunk.len();
    }
    let expected: [u8; 32] = hasher.finalize().into();
    assert_eq!(checksum, expected);
}

#[test]
fn capture_boundary_is_exact() {
    let mut sink = HashSink::new(Vec::new());
    sink.write_all(&vec![1u8; EXIF_CAPTURE_LIMIT - 1]).unwrap();
    sink.write_all(&[2, 3, 4]).unwrap();
    let (_, prefix) = sink.finish().unwrap();

    assert_eq!(prefix.len(), EXIF_CAPTURE_LIMIT);
    assert_eq!(prefix[EXIF_CAPTURE_LIMIT - 1], 2);
}
