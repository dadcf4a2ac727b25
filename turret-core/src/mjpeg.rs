//! Splitting a raw MJPEG byte stream into individual JPEG frames.
//!
//! Capture tools write concatenated JPEG images to stdout with no framing.
//! A frame starts at the SOI marker (`FF D8`) and ends at the EOI marker
//! (`FF D9`). Bytes outside a frame are discarded.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Frames larger than this are dropped as corrupt
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct FrameSplitter {
    buf: Vec<u8>,
    max_frame: usize,
    dropped: u64,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameSplitter {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
            dropped: 0,
        }
    }

    /// Number of oversized frames thrown away so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feed a chunk of stream data; returns every frame completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &SOI, 0) else {
                // Keep a trailing 0xFF, it may be the first half of an SOI
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }
            match find(&self.buf, &EOI, SOI.len()) {
                Some(end) => {
                    let frame: Vec<u8> = self.buf.drain(..end + EOI.len()).collect();
                    frames.push(frame);
                }
                None => {
                    if self.buf.len() > self.max_frame {
                        self.dropped += 1;
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// True if `data` looks like a complete JPEG image
pub fn is_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&SOI) && data.ends_with(&EOI)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn test_split_concatenated_frames() {
        let a = jpeg(b"first");
        let b = jpeg(b"second");
        let mut stream = b"garbage".to_vec();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut splitter = FrameSplitter::default();
        assert_eq!(splitter.push(&stream), vec![a, b]);
        assert!(splitter.push(&[]).is_empty());
    }

    #[test]
    fn test_frame_across_chunks() {
        let frame = jpeg(b"0123456789");
        let mut splitter = FrameSplitter::default();
        // Split right inside the SOI and EOI markers
        assert!(splitter.push(&frame[..1]).is_empty());
        assert!(splitter.push(&frame[1..frame.len() - 1]).is_empty());
        let out = splitter.push(&frame[frame.len() - 1..]);
        assert_eq!(out, vec![frame.clone()]);
        assert!(is_jpeg(&out[0]));
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let mut splitter = FrameSplitter::new(16);
        let mut big = SOI.to_vec();
        big.extend_from_slice(&[0u8; 32]);
        assert!(splitter.push(&big).is_empty());
        assert_eq!(splitter.dropped(), 1);

        let ok = jpeg(b"ok");
        assert_eq!(splitter.push(&ok), vec![ok]);
    }
}
