/// Marker every payload-bearing frame starts with.
pub const DATA_PREFIX: &str = "data:";

/// Blank line separating two frames on the wire.
pub const FRAME_DELIMITER: &[u8] = b"\n\n";

/// One complete, `data:`-prefixed unit of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    /// Returns the text following the data prefix.
    pub fn payload(&self) -> &str {
        self.0.strip_prefix(DATA_PREFIX).unwrap_or(&self.0)
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(bytes);
        // A run of three or more newlines leaves stray line breaks in front of the next frame.
        let text = text.trim_start_matches(['\r', '\n']).trim_end_matches('\r');

        if text.is_empty() {
            return None;
        }

        if !text.starts_with(DATA_PREFIX) {
            tracing::trace!(frame_len = text.len(), "dropping frame without data prefix");
            return None;
        }

        Some(Self(text.to_string()))
    }
}

impl From<&str> for Frame {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Reassembles frames from arbitrarily chunked bytes.
///
/// Bytes are buffered raw and only decoded to text once a whole frame is known, so a
/// multi-byte character split across two reads decodes the same as an unsplit one.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one chunk and returns every frame it completed, in wire order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        // The delimiter may straddle the previous chunk boundary by one byte.
        let mut search_from = self.scanned.saturating_sub(FRAME_DELIMITER.len() - 1);

        while let Some(offset) = find_delimiter(&self.buffer[search_from..]) {
            let end = search_from + offset;
            if let Some(frame) = Frame::from_bytes(&self.buffer[consumed..end]) {
                frames.push(frame);
            }
            consumed = end + FRAME_DELIMITER.len();
            search_from = consumed;
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        frames
    }

    /// Drains the buffer, returning the trailing frame when it carries content.
    pub fn flush(&mut self) -> Option<Frame> {
        self.scanned = 0;
        let remaining = std::mem::take(&mut self.buffer);
        Frame::from_bytes(&remaining)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(decoder.feed(chunk));
        }
        frames.extend(decoder.flush());
        frames
    }

    #[test]
    fn partial_frame_waits_for_delimiter() {
        let mut decoder = FrameDecoder::new();

        assert!(
            decoder
                .feed(br#"data: {"type":"text","text":"Hel"#)
                .is_empty()
        );
        let frames = decoder.feed(b"lo\"}\n\n");

        assert_eq!(frames, vec![Frame::from(r#"data: {"type":"text","text":"Hello"}"#)]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn one_chunk_can_complete_several_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: 1\n\ndata: 2\n\ndata: 3");

        assert_eq!(frames, vec![Frame::from("data: 1"), Frame::from("data: 2")]);
        assert_eq!(decoder.flush(), Some(Frame::from("data: 3")));
    }

    #[test]
    fn delimiter_split_across_chunks_is_found() {
        assert_eq!(
            decode_all(&[
                b"data: a\n".as_slice(),
                b"\ndata: b\n".as_slice(),
                b"\n".as_slice(),
            ]),
            vec![Frame::from("data: a"), Frame::from("data: b")]
        );
    }

    #[test]
    fn frames_without_data_prefix_are_dropped() {
        let frames = decode_all(&[b": keep-alive\n\nevent: ping\n\ndata: kept\n\n".as_slice()]);

        assert_eq!(frames, vec![Frame::from("data: kept")]);
    }

    #[test]
    fn flush_ignores_blank_trailing_content() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: x\n\n\n");

        assert_eq!(decoder.flush(), None);
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn extra_newlines_between_frames_do_not_hide_the_next_frame() {
        assert_eq!(
            decode_all(&[b"data: a\n\n\ndata: b\n\n".as_slice()]),
            vec![Frame::from("data: a"), Frame::from("data: b")]
        );
    }

    #[test]
    fn leading_line_breaks_before_a_frame_are_trimmed() {
        assert_eq!(
            decode_all(&[b"\ndata: a\n\n\r\ndata: b\r\n\n".as_slice()]),
            vec![Frame::from("data: a"), Frame::from("data: b")]
        );
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let bytes = "data: {\"text\":\"caf\u{e9} \u{1f600}\"}\n\n".as_bytes();
        let whole = decode_all(&[bytes]);

        for split in 1..bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(decode_all(&[head, tail]), whole, "split at byte {split}");
        }
        assert!(whole[0].payload().contains('\u{e9}'));
    }

    #[test]
    fn payload_strips_only_the_prefix() {
        let frame = Frame::from("data: {\"type\":\"done\"}");

        assert_eq!(frame.payload(), " {\"type\":\"done\"}");
    }

    fn stream_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(
            prop_oneof![
                "[a-z ]{0,12}".prop_map(|text| format!("data: {{\"type\":\"text\",\"text\":\"{text}\"}}\n\n")),
                Just("data: {\"type\":\"done\"}\n\n".to_string()),
                Just(": ping\n\n".to_string()),
                Just("data: {\"type\":\"text\",\"text\":\"\u{e9}\u{1f600}\"}\n\n".to_string()),
                Just("\n".to_string()),
            ],
            0..12,
        )
        .prop_map(|pieces| pieces.concat().into_bytes())
    }

    proptest! {
        #[test]
        fn chunking_never_changes_the_frame_sequence(
            bytes in stream_bytes(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
        ) {
            let whole = decode_all(&[bytes.as_slice()]);

            let mut offsets = cuts
                .iter()
                .map(|cut| cut.index(bytes.len() + 1))
                .collect::<Vec<_>>();
            offsets.sort_unstable();
            offsets.dedup();

            let mut chunks = Vec::new();
            let mut start = 0;
            for offset in offsets {
                chunks.push(&bytes[start..offset]);
                start = offset;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(decode_all(&chunks), whole);
        }
    }
}
